//! Dispatch coordinator: fan-out of routed (token, expert) pairs to workers
//!
//! ```text
//! RoutingDecisions ─► select_replica ─► group by node ─► per-node window ─► send
//!                                                                            │
//!                       Aggregator ◄── Delivery::{Result, Skipped} ◄─────────┘
//! ```
//!
//! One request is issued per destination node per layer (split when a group
//! exceeds `max_tokens_per_request`). Each node has a window of
//! `max_inflight_per_node` permits; `dispatch` waits for a permit rather than
//! dropping or reordering work. A failed or timed-out request is retried
//! once against alternate replicas; pairs that still cannot be computed are
//! delivered as zero-weight skips.

use crate::cancel::CancelToken;
use crate::errors::{MoeError, Result};
use crate::kernel::ExpertComputeKernel;
use crate::network::{ClusterTransport, DispatchEntry, DispatchRequest, PartialResultBatch, ResultStatus};
use crate::registry::{ExpertRegistry, NodeId};
use crate::routing::{ExpertId, RoutingDecision, Token, TokenId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::aggregator::{Delivery, DeliverySink};
use super::stats::MoeStats;

/// Timeouts and limits for dispatch
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget for one request round trip (including the worker's compute)
    pub request_timeout: Duration,

    /// Budget for a whole layer batch; never shorter than `request_timeout`
    pub batch_timeout: Duration,

    /// Requests allowed in flight to a single node
    pub max_inflight_per_node: usize,

    /// Pairs per request before a node group is split
    pub max_tokens_per_request: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            batch_timeout: Duration::from_millis(2000),
            max_inflight_per_node: 4,
            max_tokens_per_request: 1024,
        }
    }
}

/// Handle to the requests of one dispatched batch.
///
/// Dropping the handle (or calling [`abandon`](Self::abandon)) aborts the
/// dispatch tasks still running; their transport futures are dropped with
/// them.
#[derive(Debug)]
pub struct PendingBatch {
    pub batch_id: u64,
    pub layer: u32,
    /// When the aggregator stops waiting for this batch
    pub deadline: Instant,
    decisions: Arc<[RoutingDecision]>,
    tasks: Vec<JoinHandle<()>>,
    skipped_pairs: usize,
}

impl PendingBatch {
    pub(crate) fn new(
        batch_id: u64,
        layer: u32,
        decisions: Arc<[RoutingDecision]>,
        deadline: Instant,
    ) -> Self {
        Self {
            batch_id,
            layer,
            deadline,
            decisions,
            tasks: Vec::new(),
            skipped_pairs: 0,
        }
    }

    pub fn decisions(&self) -> &Arc<[RoutingDecision]> {
        &self.decisions
    }

    pub fn token_ids(&self) -> Vec<TokenId> {
        self.decisions.iter().map(|d| d.token_id).collect()
    }

    /// Requests issued for this batch (first attempts only)
    pub fn requests(&self) -> usize {
        self.tasks.len()
    }

    /// Pairs skipped at dispatch time because no replica was available
    pub fn skipped_pairs(&self) -> usize {
        self.skipped_pairs
    }

    /// Whether every dispatch task has finished
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Wait for every dispatch task, including retries
    pub async fn join(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn abandon(self) {
        drop(self);
    }
}

impl Drop for PendingBatch {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// In-flight window and sequence counter of one node
struct NodeLane {
    window: Arc<Semaphore>,
    last_sequence: AtomicU64,
}

/// State shared between the coordinator and its dispatch tasks
struct Shared {
    registry: Arc<ExpertRegistry>,
    transport: Arc<dyn ClusterTransport>,
    /// Prices requests for registry load feedback
    cost_model: Arc<dyn ExpertComputeKernel>,
    config: DispatchConfig,
    lanes: Mutex<HashMap<NodeId, Arc<NodeLane>>>,
    stats: Arc<MoeStats>,
}

/// Issues routed pairs to worker nodes and feeds outcomes to the aggregator.
pub struct DispatchCoordinator {
    shared: Arc<Shared>,
    next_batch: AtomicU64,
}

impl DispatchCoordinator {
    /// `cost_model` prices each request with
    /// [`ExpertComputeKernel::cost_estimate`]; it is usually the same kernel
    /// type the workers run.
    pub fn new(
        registry: Arc<ExpertRegistry>,
        transport: Arc<dyn ClusterTransport>,
        cost_model: Arc<dyn ExpertComputeKernel>,
        config: DispatchConfig,
        stats: Arc<MoeStats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                transport,
                cost_model,
                config,
                lanes: Mutex::new(HashMap::new()),
                stats,
            }),
            next_batch: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ExpertRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> &Arc<MoeStats> {
        &self.shared.stats
    }

    /// Requests currently holding a window permit on `node`
    pub fn inflight(&self, node: &NodeId) -> usize {
        let lane = self.shared.lane(node);
        self.shared
            .config
            .max_inflight_per_node
            .saturating_sub(lane.window.available_permits())
    }

    /// Send every (token, expert) pair of `decisions` to a replica of its
    /// expert. `tokens[i]` must be the token of `decisions[i]`.
    ///
    /// Suspends while a destination node's window is full. Outcomes arrive
    /// on `sink` as [`Delivery`] messages tagged with the returned batch id.
    ///
    /// # Errors
    /// - `InvalidDimension` if `tokens` and `decisions` differ in length
    /// - `Config` if a token is paired with another token's decision
    /// - `ClusterUnavailable` if no pair could be placed on any node
    /// - `Cancelled` if `cancel` fires while waiting for a window
    #[instrument(skip_all, fields(layer = layer, tokens = tokens.len()))]
    pub async fn dispatch(
        &self,
        layer: u32,
        tokens: &[Token],
        decisions: Arc<[RoutingDecision]>,
        sink: &DeliverySink,
        cancel: &CancelToken,
    ) -> Result<PendingBatch> {
        if tokens.len() != decisions.len() {
            return Err(MoeError::InvalidDimension {
                expected: decisions.len(),
                actual: tokens.len(),
            });
        }
        if cancel.is_cancelled() {
            return Err(MoeError::Cancelled);
        }

        let config = &self.shared.config;
        let batch_id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let mut pending = PendingBatch::new(
            batch_id,
            layer,
            decisions.clone(),
            Instant::now() + config.batch_timeout,
        );

        let mut groups: BTreeMap<NodeId, Vec<DispatchEntry>> = BTreeMap::new();
        let mut unplaced: Vec<(TokenId, ExpertId, String)> = Vec::new();
        let mut total_pairs = 0usize;

        for (token, decision) in tokens.iter().zip(decisions.iter()) {
            if token.id != decision.token_id {
                return Err(MoeError::Config(format!(
                    "token {} paired with routing decision for token {}",
                    token.id, decision.token_id
                )));
            }
            for selection in &decision.selections {
                total_pairs += 1;
                match self.shared.registry.select_replica(selection.expert_id).await {
                    Ok(node) => groups.entry(node).or_default().push(DispatchEntry {
                        token_id: token.id,
                        expert_id: selection.expert_id,
                        hidden_state: token.hidden_state.clone(),
                    }),
                    Err(e) => unplaced.push((token.id, selection.expert_id, e.to_string())),
                }
            }
        }

        if total_pairs > 0 && groups.is_empty() {
            return Err(MoeError::ClusterUnavailable(format!(
                "none of {} expert selections has a reachable replica",
                total_pairs
            )));
        }

        if !unplaced.is_empty() {
            warn!(batch_id, pairs = unplaced.len(), "Skipping pairs with no available replica");
            pending.skipped_pairs = unplaced.len();
            self.shared.stats.record_skips(unplaced.len());
            for (token_id, expert_id, reason) in unplaced {
                let _ = sink.send(Delivery::Skipped {
                    batch_id,
                    token_id,
                    expert_id,
                    reason,
                });
            }
        }

        let chunk_size = config.max_tokens_per_request.max(1);
        for (node, entries) in groups {
            for chunk in entries.chunks(chunk_size) {
                let (permit, sequence) = self.shared.acquire(&node, cancel).await?;
                let task = tokio::spawn(run_request(
                    self.shared.clone(),
                    RequestCtx {
                        node: node.clone(),
                        layer,
                        batch_id,
                        sink: sink.clone(),
                        cancel: cancel.clone(),
                    },
                    sequence,
                    chunk.to_vec(),
                    permit,
                ));
                pending.tasks.push(task);
            }
        }

        debug!(
            batch_id,
            requests = pending.requests(),
            skipped = pending.skipped_pairs,
            "Batch dispatched"
        );
        Ok(pending)
    }
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Where a request's outcome goes
#[derive(Clone)]
struct RequestCtx {
    node: NodeId,
    layer: u32,
    batch_id: u64,
    sink: DeliverySink,
    cancel: CancelToken,
}

impl Shared {
    fn lane(&self, node: &NodeId) -> Arc<NodeLane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .entry(node.clone())
            .or_insert_with(|| {
                Arc::new(NodeLane {
                    window: Arc::new(Semaphore::new(self.config.max_inflight_per_node.max(1))),
                    last_sequence: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Take a window permit on `node`, waiting if the window is full, then
    /// assign the node's next sequence number.
    async fn acquire(&self, node: &NodeId, cancel: &CancelToken) -> Result<(OwnedSemaphorePermit, u64)> {
        let lane = self.lane(node);
        let permit = match lane.window.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.stats.record_backpressure();
                debug!(node = %node, "In-flight window full, waiting");
                tokio::select! {
                    permit = lane.window.clone().acquire_owned() => {
                        permit.map_err(|_| MoeError::transport(node, "dispatch window closed"))?
                    }
                    _ = cancel.cancelled() => return Err(MoeError::Cancelled),
                }
            }
            Err(TryAcquireError::Closed) => {
                return Err(MoeError::transport(node, "dispatch window closed"))
            }
        };
        let sequence = lane.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((permit, sequence))
    }

    /// Estimated kernel cost of `entries`, summed per expert
    fn request_cost(&self, entries: &[DispatchEntry]) -> f64 {
        let mut rows: BTreeMap<ExpertId, usize> = BTreeMap::new();
        for entry in entries {
            *rows.entry(entry.expert_id).or_default() += 1;
        }
        rows.into_iter()
            .map(|(expert, rows)| self.cost_model.cost_estimate(expert, rows))
            .sum()
    }

    /// One round trip, bounded by `request_timeout`, with load feedback.
    async fn send_once(
        &self,
        node: &NodeId,
        request: DispatchRequest,
    ) -> Result<PartialResultBatch> {
        let cost = self.request_cost(&request.entries);
        let sequence = request.sequence;
        self.stats.record_request();
        self.registry.record_dispatch(node, cost).await;
        let load = LoadGuard::new(self.registry.clone(), node.clone(), cost);

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.request_timeout, self.transport.send(node, request))
                .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match outcome {
            Ok(Ok(batch)) if batch.is_ok() => {
                if batch.sequence == sequence {
                    Ok(batch)
                } else {
                    Err(MoeError::transport(
                        node,
                        format!("response sequence {} for request {}", batch.sequence, sequence),
                    ))
                }
            }
            Ok(Ok(batch)) => Err(match batch.status {
                ResultStatus::DeadlineExceeded => MoeError::DeadlineExceeded { elapsed_ms },
                _ => MoeError::Kernel(batch.error.unwrap_or_else(|| "worker reported failure".into())),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MoeError::DeadlineExceeded { elapsed_ms }),
        };

        load.release().await;
        match &outcome {
            Ok(_) => self.stats.record_request_latency(elapsed_ms),
            Err(e) => self
                .stats
                .record_request_failure(matches!(e, MoeError::DeadlineExceeded { .. })),
        }
        outcome
    }

    fn request(&self, ctx: &RequestCtx, sequence: u64, entries: Vec<DispatchEntry>) -> DispatchRequest {
        DispatchRequest {
            sequence,
            layer: ctx.layer,
            timeout_ms: self.config.request_timeout.as_millis().min(u32::MAX as u128) as u32,
            entries,
        }
    }

    /// Forward a successful batch to the aggregator. Requested pairs missing
    /// from the response are skipped.
    fn deliver(&self, ctx: &RequestCtx, entries: &[DispatchEntry], batch: PartialResultBatch) {
        let mut outstanding: HashSet<(TokenId, ExpertId)> =
            entries.iter().map(|e| (e.token_id, e.expert_id)).collect();

        for partial in batch.results {
            if !outstanding.remove(&(partial.token_id, partial.expert_id)) {
                debug!(
                    node = %ctx.node,
                    token_id = partial.token_id,
                    expert_id = partial.expert_id,
                    "Ignoring result that was not requested"
                );
                continue;
            }
            let _ = ctx.sink.send(Delivery::Result {
                batch_id: ctx.batch_id,
                partial,
            });
        }

        if !outstanding.is_empty() {
            let missing: Vec<DispatchEntry> = entries
                .iter()
                .filter(|e| outstanding.contains(&(e.token_id, e.expert_id)))
                .cloned()
                .collect();
            self.skip(ctx, &missing, "missing from worker response");
        }
    }

    fn skip(&self, ctx: &RequestCtx, entries: &[DispatchEntry], reason: &str) {
        self.stats.record_skips(entries.len());
        for entry in entries {
            let _ = ctx.sink.send(Delivery::Skipped {
                batch_id: ctx.batch_id,
                token_id: entry.token_id,
                expert_id: entry.expert_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Re-send the pairs of a failed request to alternate replicas, once.
    async fn retry(&self, ctx: &RequestCtx, entries: Vec<DispatchEntry>, cause: &MoeError) {
        let failed = [ctx.node.clone()];
        let mut groups: BTreeMap<NodeId, Vec<DispatchEntry>> = BTreeMap::new();
        let mut stranded = Vec::new();

        for entry in entries {
            match self
                .registry
                .select_replica_excluding(entry.expert_id, &failed)
                .await
            {
                Ok(node) => groups.entry(node).or_default().push(entry),
                Err(_) => stranded.push(entry),
            }
        }

        if !stranded.is_empty() {
            warn!(
                node = %ctx.node,
                pairs = stranded.len(),
                error = %cause,
                "No alternate replica, skipping pairs"
            );
            self.skip(ctx, &stranded, &format!("no alternate replica after: {cause}"));
        }

        let attempts = groups.into_iter().map(|(node, entries)| async move {
            let alt = RequestCtx {
                node: node.clone(),
                ..ctx.clone()
            };
            self.stats.record_retry();
            let (permit, sequence) = match self.acquire(&node, &ctx.cancel).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.skip(&alt, &entries, &format!("retry not issued: {e}"));
                    return;
                }
            };
            debug!(from = %ctx.node, to = %node, sequence, pairs = entries.len(), "Retrying on alternate replica");

            let outcome = self.send_once(&node, self.request(&alt, sequence, entries.clone())).await;
            drop(permit);
            match outcome {
                Ok(batch) => self.deliver(&alt, &entries, batch),
                Err(e) => {
                    warn!(node = %node, sequence, error = %e, "Retry failed, skipping pairs");
                    self.skip(&alt, &entries, &format!("retry failed: {e}"));
                }
            }
        });
        futures::future::join_all(attempts).await;
    }
}

/// Returns dispatched cost to the registry exactly once, even when the
/// request future is dropped by cancellation or an aborted batch.
struct LoadGuard {
    registry: Arc<ExpertRegistry>,
    node: NodeId,
    cost: f64,
    armed: bool,
}

impl LoadGuard {
    fn new(registry: Arc<ExpertRegistry>, node: NodeId, cost: f64) -> Self {
        Self {
            registry,
            node,
            cost,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.registry.record_completion(&self.node, self.cost).await;
        self.armed = false;
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The registry lock is async, so the completion runs as its own task
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let node = self.node.clone();
                let cost = self.cost;
                handle.spawn(async move {
                    registry.record_completion(&node, cost).await;
                });
            }
            Err(_) => warn!(
                node = %self.node,
                cost = self.cost,
                "No runtime to release dispatched load"
            ),
        }
    }
}

async fn run_request(
    shared: Arc<Shared>,
    ctx: RequestCtx,
    sequence: u64,
    entries: Vec<DispatchEntry>,
    permit: OwnedSemaphorePermit,
) {
    let cancel = ctx.cancel.clone();
    let work = async {
        let request = shared.request(&ctx, sequence, entries.clone());
        let outcome = shared.send_once(&ctx.node, request).await;
        drop(permit);

        match outcome {
            Ok(batch) => shared.deliver(&ctx, &entries, batch),
            Err(e) => {
                warn!(node = %ctx.node, sequence, error = %e, "Dispatch request failed");
                shared.retry(&ctx, entries, &e).await;
            }
        }
    };

    tokio::select! {
        _ = work => {}
        _ = cancel.cancelled() => {
            debug!(node = %ctx.node, sequence, "Dispatch task cancelled");
        }
    }
}
