//! Weighted combination of partial expert outputs
//!
//! The aggregator is the consumer half of the dispatch pipeline. Dispatch
//! tasks never touch its state; they push [`Delivery`] messages into the
//! channel returned by [`Aggregator::sink`], and [`Aggregator::await_batch`]
//! drains that channel into per-token slots until every expected expert has
//! reported or the batch deadline fires.
//!
//! Each slot accumulates `Σ gate_weight · output` over the experts that
//! arrived. A (token, expert) pair is counted at most once; duplicates and
//! deliveries for closed batches are dropped and counted. When some experts
//! never arrive, the surviving weights are renormalized to 1.0 and the
//! output is flagged [`OutputStatus::Partial`].

use crate::cancel::CancelToken;
use crate::errors::{MoeError, Result};
use crate::network::PartialResult;
use crate::routing::{ExpertId, RoutingDecision, TokenId};
use crate::tensor::{axpy, TensorBuffer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dispatch::PendingBatch;
use super::stats::MoeStats;

/// Message from a dispatch task to the aggregator
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An expert output for one token
    Result { batch_id: u64, partial: PartialResult },
    /// The pair could not be computed; contributes zero weight
    Skipped {
        batch_id: u64,
        token_id: TokenId,
        expert_id: ExpertId,
        reason: String,
    },
}

/// Sending half handed to the dispatch coordinator
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// Every selected expert contributed
    Complete,
    /// At least one token is missing an expert; weights were renormalized
    Partial,
}

/// Per-token outputs of one layer, rows in the requested token order
#[derive(Debug, Clone)]
pub struct CombinedOutput {
    pub token_ids: Vec<TokenId>,
    pub outputs: TensorBuffer,
    pub status: OutputStatus,
    /// (token, expert) pairs that did not contribute
    pub missing: Vec<(TokenId, ExpertId)>,
}

impl CombinedOutput {
    pub fn is_partial(&self) -> bool {
        self.status == OutputStatus::Partial
    }

    pub fn output_for(&self, token_id: TokenId) -> Option<&[f32]> {
        self.token_ids
            .iter()
            .position(|&t| t == token_id)
            .map(|idx| self.outputs.row(idx))
    }

    /// Tokens with at least one missing expert
    pub fn degraded_tokens(&self) -> BTreeSet<TokenId> {
        self.missing.iter().map(|(t, _)| *t).collect()
    }
}

/// Accumulator for one token of one batch
struct Slot {
    batch_id: u64,
    layer: u32,
    deadline: Instant,
    decisions: Arc<[RoutingDecision]>,
    index: usize,
    sum: Vec<f32>,
    arrived_weight: f32,
    received: BTreeSet<ExpertId>,
    skipped: BTreeSet<ExpertId>,
}

impl Slot {
    fn decision(&self) -> &RoutingDecision {
        &self.decisions[self.index]
    }

    fn pending(&self) -> usize {
        self.decision().top_k() - self.received.len() - self.skipped.len()
    }

    fn settled(&self, expert_id: ExpertId) -> bool {
        self.received.contains(&expert_id) || self.skipped.contains(&expert_id)
    }

    /// Final row, renormalized over the experts that arrived
    fn finish(&self) -> Vec<f32> {
        if self.arrived_weight > 0.0 && self.received.len() < self.decision().top_k() {
            let scale = 1.0 / self.arrived_weight;
            self.sum.iter().map(|v| v * scale).collect()
        } else {
            self.sum.clone()
        }
    }

    fn missing(&self) -> impl Iterator<Item = ExpertId> + '_ {
        self.decision()
            .expert_ids()
            .filter(move |e| !self.received.contains(e))
    }
}

/// Collects deliveries into combined per-token outputs.
pub struct Aggregator {
    hidden_size: usize,
    tx: DeliverySink,
    rx: mpsc::UnboundedReceiver<Delivery>,
    slots: HashMap<TokenId, Slot>,
    open_batches: HashSet<u64>,
    stats: Arc<MoeStats>,
}

impl Aggregator {
    pub fn new(hidden_size: usize, stats: Arc<MoeStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            hidden_size,
            tx,
            rx,
            slots: HashMap::new(),
            open_batches: HashSet::new(),
            stats,
        }
    }

    /// Channel the dispatch coordinator delivers into
    pub fn sink(&self) -> DeliverySink {
        self.tx.clone()
    }

    /// Tokens with an open slot
    pub fn open_slots(&self) -> usize {
        self.slots.len()
    }

    /// Open one slot per token of `batch`.
    ///
    /// # Errors
    /// `Config` if a token already has an open slot from another batch.
    pub fn expect(&mut self, batch: &PendingBatch) -> Result<()> {
        let decisions = batch.decisions();
        if let Some(d) = decisions.iter().find(|d| self.slots.contains_key(&d.token_id)) {
            return Err(MoeError::Config(format!(
                "token {} already awaiting aggregation",
                d.token_id
            )));
        }

        for (index, decision) in decisions.iter().enumerate() {
            self.slots.insert(
                decision.token_id,
                Slot {
                    batch_id: batch.batch_id,
                    layer: batch.layer,
                    deadline: batch.deadline,
                    decisions: decisions.clone(),
                    index,
                    sum: vec![0.0; self.hidden_size],
                    arrived_weight: 0.0,
                    received: BTreeSet::new(),
                    skipped: BTreeSet::new(),
                },
            );
        }
        self.open_batches.insert(batch.batch_id);
        Ok(())
    }

    /// Apply one partial result to the open slot of its token.
    ///
    /// Partials for unknown tokens, closed slots or another layer are
    /// dropped and counted as late; repeated pairs are counted as duplicates.
    pub fn accept(&mut self, partial: PartialResult) {
        let Some(slot) = self.slots.get(&partial.token_id) else {
            self.stats.record_late();
            return;
        };
        if slot.layer != partial.layer {
            self.stats.record_late();
            return;
        }
        let batch_id = slot.batch_id;
        self.apply(Delivery::Result { batch_id, partial });
    }

    fn apply(&mut self, delivery: Delivery) {
        let batch_id = match &delivery {
            Delivery::Result { batch_id, .. } | Delivery::Skipped { batch_id, .. } => *batch_id,
        };
        if !self.open_batches.contains(&batch_id) {
            self.stats.record_late();
            return;
        }

        match delivery {
            Delivery::Result { partial, .. } => {
                let Some(slot) = self
                    .slots
                    .get_mut(&partial.token_id)
                    .filter(|s| s.batch_id == batch_id)
                else {
                    self.stats.record_late();
                    return;
                };
                let Some(weight) = slot.decision().weight_for(partial.expert_id) else {
                    self.stats.record_malformed();
                    warn!(
                        token_id = partial.token_id,
                        expert_id = partial.expert_id,
                        "Partial for an expert the token was not routed to"
                    );
                    return;
                };
                if slot.settled(partial.expert_id) {
                    self.stats.record_duplicate();
                    debug!(
                        token_id = partial.token_id,
                        expert_id = partial.expert_id,
                        sequence = partial.sequence,
                        "Dropped duplicate partial"
                    );
                    return;
                }
                if partial.output.len() != self.hidden_size {
                    self.stats.record_malformed();
                    warn!(
                        token_id = partial.token_id,
                        expert_id = partial.expert_id,
                        expected = self.hidden_size,
                        actual = partial.output.len(),
                        "Partial output has wrong width, treating as skipped"
                    );
                    slot.skipped.insert(partial.expert_id);
                    return;
                }

                axpy(&mut slot.sum, weight, &partial.output);
                slot.arrived_weight += weight;
                slot.received.insert(partial.expert_id);
            }
            Delivery::Skipped {
                token_id,
                expert_id,
                reason,
                ..
            } => {
                let Some(slot) = self
                    .slots
                    .get_mut(&token_id)
                    .filter(|s| s.batch_id == batch_id)
                else {
                    self.stats.record_late();
                    return;
                };
                if slot.decision().weight_for(expert_id).is_none() {
                    self.stats.record_malformed();
                    return;
                }
                if slot.settled(expert_id) {
                    self.stats.record_duplicate();
                    return;
                }
                debug!(token_id, expert_id, %reason, "Expert skipped");
                slot.skipped.insert(expert_id);
            }
        }
    }

    fn all_settled(&self, token_ids: &[TokenId]) -> bool {
        token_ids
            .iter()
            .filter_map(|t| self.slots.get(t))
            .all(|s| s.pending() == 0)
    }

    /// Wait until every expert of every token in `token_ids` reported or the
    /// batch deadline elapsed, then emit the combined outputs and close the
    /// slots.
    ///
    /// # Errors
    /// - `UnknownToken` if a token has no open slot
    /// - `Cancelled` if `cancel` fires first; the slots are discarded
    pub async fn await_batch(
        &mut self,
        token_ids: &[TokenId],
        cancel: &CancelToken,
    ) -> Result<CombinedOutput> {
        let mut deadline: Option<Instant> = None;
        for token_id in token_ids {
            let slot = self
                .slots
                .get(token_id)
                .ok_or(MoeError::UnknownToken(*token_id))?;
            deadline = Some(deadline.map_or(slot.deadline, |d| d.max(slot.deadline)));
        }
        let Some(deadline) = deadline else {
            return Ok(CombinedOutput {
                token_ids: Vec::new(),
                outputs: TensorBuffer::zeros(0, self.hidden_size),
                status: OutputStatus::Complete,
                missing: Vec::new(),
            });
        };

        let mut timed_out = false;
        while !self.all_settled(token_ids) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.discard(token_ids);
                    self.stats.record_cancellation();
                    return Err(MoeError::Cancelled);
                }
                delivery = self.rx.recv() => {
                    // The aggregator holds a sender, so the channel never closes
                    if let Some(delivery) = delivery {
                        self.apply(delivery);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        Ok(self.emit(token_ids, timed_out))
    }

    fn emit(&mut self, token_ids: &[TokenId], timed_out: bool) -> CombinedOutput {
        let mut outputs = TensorBuffer::zeros(token_ids.len(), self.hidden_size);
        let mut missing = Vec::new();
        let mut batches = HashSet::new();

        for (row, token_id) in token_ids.iter().enumerate() {
            let Some(slot) = self.slots.remove(token_id) else {
                continue;
            };
            batches.insert(slot.batch_id);
            outputs.row_mut(row).copy_from_slice(&slot.finish());
            missing.extend(slot.missing().map(|e| (*token_id, e)));
        }
        self.close_finished(batches);

        if timed_out && !missing.is_empty() {
            self.stats.record_batch_deadline();
            warn!(
                tokens = token_ids.len(),
                missing = missing.len(),
                "Batch deadline elapsed with experts missing"
            );
        }

        let status = if missing.is_empty() {
            OutputStatus::Complete
        } else {
            OutputStatus::Partial
        };
        CombinedOutput {
            token_ids: token_ids.to_vec(),
            outputs,
            status,
            missing,
        }
    }

    /// Drop the slots of `token_ids` without emitting anything
    pub fn discard(&mut self, token_ids: &[TokenId]) {
        let batches = token_ids
            .iter()
            .filter_map(|t| self.slots.remove(t))
            .map(|s| s.batch_id)
            .collect();
        self.close_finished(batches);
    }

    /// Close every batch in `candidates` that has no slot left
    fn close_finished(&mut self, candidates: HashSet<u64>) {
        for batch_id in candidates {
            if !self.slots.values().any(|s| s.batch_id == batch_id) {
                self.open_batches.remove(&batch_id);
            }
        }
    }

    /// Process queued deliveries without waiting. Returns how many were
    /// handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            self.apply(delivery);
            handled += 1;
        }
        handled
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("hidden_size", &self.hidden_size)
            .field("open_slots", &self.slots.len())
            .field("open_batches", &self.open_batches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ExpertSelection;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const WIDTH: usize = 2;

    fn decision(token_id: TokenId, experts: &[(ExpertId, f32)]) -> RoutingDecision {
        RoutingDecision {
            token_id,
            selections: experts
                .iter()
                .map(|&(expert_id, gate_weight)| ExpertSelection {
                    expert_id,
                    gate_weight,
                })
                .collect(),
        }
    }

    fn partial(token_id: TokenId, expert_id: ExpertId, output: Vec<f32>) -> PartialResult {
        PartialResult {
            token_id,
            expert_id,
            sequence: 1,
            layer: 0,
            output,
        }
    }

    fn setup(batch_id: u64, decisions: Vec<RoutingDecision>) -> (Aggregator, PendingBatch, Arc<MoeStats>) {
        let stats = Arc::new(MoeStats::new());
        let mut agg = Aggregator::new(WIDTH, stats.clone());
        let batch = PendingBatch::new(
            batch_id,
            0,
            decisions.into(),
            Instant::now() + Duration::from_millis(200),
        );
        agg.expect(&batch).unwrap();
        (agg, batch, stats)
    }

    fn result(batch_id: u64, p: PartialResult) -> Delivery {
        Delivery::Result {
            batch_id,
            partial: p,
        }
    }

    #[tokio::test]
    async fn test_complete_weighted_sum() {
        let (mut agg, batch, _) = setup(
            1,
            vec![decision(10, &[(2, 0.75), (5, 0.25)]), decision(11, &[(0, 0.5), (2, 0.5)])],
        );
        let sink = agg.sink();
        sink.send(result(1, partial(10, 2, vec![4.0, 8.0]))).unwrap();
        sink.send(result(1, partial(10, 5, vec![4.0, 0.0]))).unwrap();
        sink.send(result(1, partial(11, 2, vec![2.0, 2.0]))).unwrap();
        sink.send(result(1, partial(11, 0, vec![0.0, 4.0]))).unwrap();

        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out.status, OutputStatus::Complete);
        assert_eq!(out.output_for(10).unwrap(), &[4.0, 6.0]);
        assert_eq!(out.output_for(11).unwrap(), &[1.0, 3.0]);
        assert!(out.missing.is_empty());
        assert_eq!(agg.open_slots(), 0);
    }

    #[tokio::test]
    async fn test_duplicates_and_late_partials_are_dropped() {
        let (mut agg, batch, stats) = setup(1, vec![decision(1, &[(3, 1.0)])]);
        let sink = agg.sink();
        sink.send(result(1, partial(1, 3, vec![1.0, 1.0]))).unwrap();
        sink.send(result(1, partial(1, 3, vec![100.0, 100.0]))).unwrap();

        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out.output_for(1).unwrap(), &[1.0, 1.0]);

        // Duplicate queued behind the completing partial, plus a late one
        sink.send(result(1, partial(1, 3, vec![9.0, 9.0]))).unwrap();
        agg.drain();
        let snap = stats.snapshot();
        assert_eq!(snap.duplicate_partials + snap.late_partials, 2);
        assert!(snap.late_partials >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_renormalizes_survivors() {
        let (mut agg, batch, stats) = setup(4, vec![decision(7, &[(1, 0.6), (2, 0.4)])]);
        agg.sink()
            .send(result(4, partial(7, 2, vec![5.0, -5.0])))
            .unwrap();

        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert!(out.is_partial());
        assert_eq!(out.missing, vec![(7, 1)]);
        let row = out.output_for(7).unwrap();
        assert!((row[0] - 5.0).abs() < 1e-6);
        assert!((row[1] + 5.0).abs() < 1e-6);
        assert_eq!(stats.snapshot().batch_deadlines, 1);
    }

    #[tokio::test]
    async fn test_skip_settles_without_waiting() {
        let (mut agg, batch, stats) = setup(2, vec![decision(3, &[(0, 0.5), (1, 0.5)])]);
        let sink = agg.sink();
        sink.send(Delivery::Skipped {
            batch_id: 2,
            token_id: 3,
            expert_id: 1,
            reason: "node down".into(),
        })
        .unwrap();
        sink.send(result(2, partial(3, 0, vec![2.0, 4.0]))).unwrap();

        let out = tokio::time::timeout(
            Duration::from_millis(100),
            agg.await_batch(&batch.token_ids(), &CancelToken::new()),
        )
        .await
        .expect("skip should settle the slot before the deadline")
        .unwrap();
        assert!(out.is_partial());
        assert_eq!(out.output_for(3).unwrap(), &[2.0, 4.0]);
        assert_eq!(out.degraded_tokens().into_iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(stats.snapshot().batch_deadlines, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_arrived_yields_zeros() {
        let (mut agg, batch, _) = setup(1, vec![decision(1, &[(0, 1.0)])]);
        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert!(out.is_partial());
        assert_eq!(out.output_for(1).unwrap(), &[0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_wrong_width_counts_as_malformed() {
        let (mut agg, batch, stats) = setup(1, vec![decision(1, &[(0, 0.5), (1, 0.5)])]);
        let sink = agg.sink();
        sink.send(result(1, partial(1, 0, vec![1.0, 2.0, 3.0]))).unwrap();
        sink.send(result(1, partial(1, 1, vec![1.0, 1.0]))).unwrap();

        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert!(out.is_partial());
        assert_eq!(out.output_for(1).unwrap(), &[1.0, 1.0]);
        assert_eq!(stats.malformed_partials.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_accept_applies_to_open_slot() {
        let (mut agg, batch, stats) = setup(1, vec![decision(8, &[(6, 1.0)])]);
        agg.accept(partial(8, 6, vec![3.0, 3.0]));
        agg.accept(partial(99, 6, vec![3.0, 3.0]));

        let out = agg
            .await_batch(&batch.token_ids(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out.status, OutputStatus::Complete);
        assert_eq!(stats.snapshot().late_partials, 1);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (mut agg, _batch, _) = setup(1, vec![decision(1, &[(0, 1.0)])]);
        assert!(matches!(
            agg.await_batch(&[1, 2], &CancelToken::new()).await,
            Err(MoeError::UnknownToken(2))
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_slots() {
        let (mut agg, batch, stats) = setup(1, vec![decision(1, &[(0, 1.0)])]);
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            agg.await_batch(&batch.token_ids(), &cancel).await,
            Err(MoeError::Cancelled)
        ));
        assert_eq!(agg.open_slots(), 0);
        assert_eq!(stats.snapshot().cancellations, 1);

        agg.sink()
            .send(result(1, partial(1, 0, vec![1.0, 1.0])))
            .unwrap();
        agg.drain();
        assert_eq!(stats.snapshot().late_partials, 1);
    }

    #[tokio::test]
    async fn test_expect_rejects_token_already_open() {
        let (mut agg, _batch, _) = setup(1, vec![decision(1, &[(0, 1.0)])]);
        let other = PendingBatch::new(
            2,
            1,
            vec![decision(1, &[(0, 1.0)])].into(),
            Instant::now(),
        );
        assert!(matches!(agg.expect(&other), Err(MoeError::Config(_))));
    }
}
