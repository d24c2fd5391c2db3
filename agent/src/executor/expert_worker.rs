//! Expert execution on a worker node
//!
//! An [`ExpertWorker`] owns the set of experts placed on its node and turns a
//! [`DispatchRequest`] into a [`PartialResultBatch`]:
//!
//! ```text
//! DispatchRequest → group by expert → ExpertComputeKernel::run → PartialResultBatch
//! ```
//!
//! Both transports drive the same worker: the in-process transport calls it
//! directly and the TCP server calls it from the blocking thread pool.

use crate::kernel::ExpertComputeKernel;
use crate::network::{DispatchRequest, PartialResult, PartialResultBatch, ResultStatus};
use crate::registry::NodeId;
use crate::routing::ExpertId;
use crate::tensor::TensorBuffer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Worker execution statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Requests answered with status `Ok`
    pub requests_completed: AtomicU64,

    /// Requests answered with an error status
    pub requests_failed: AtomicU64,

    /// (token, expert) pairs computed
    pub pairs_computed: AtomicU64,

    /// Total kernel time across all requests (milliseconds)
    pub total_compute_time_ms: AtomicU64,

    /// Requests currently executing
    pub active_requests: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, pairs: u64, compute_time_ms: u64) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.pairs_computed.fetch_add(pairs, Ordering::Relaxed);
        self.total_compute_time_ms
            .fetch_add(compute_time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, compute_time_ms: u64) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.total_compute_time_ms
            .fetch_add(compute_time_ms, Ordering::Relaxed);
    }

    pub fn start_request(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_request(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_completed.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed)
    }
}

/// Executes the experts hosted on one node.
///
/// Cheap to clone; clones share the kernel and the statistics.
#[derive(Clone)]
pub struct ExpertWorker {
    node_id: NodeId,
    hosted: Arc<BTreeSet<ExpertId>>,
    kernel: Arc<dyn ExpertComputeKernel>,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for ExpertWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertWorker")
            .field("node_id", &self.node_id)
            .field("hosted", &self.hosted)
            .finish()
    }
}

impl ExpertWorker {
    pub fn new(
        node_id: NodeId,
        hosted: impl IntoIterator<Item = ExpertId>,
        kernel: Arc<dyn ExpertComputeKernel>,
    ) -> Self {
        Self {
            node_id,
            hosted: Arc::new(hosted.into_iter().collect()),
            kernel,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn hosts(&self, expert_id: ExpertId) -> bool {
        self.hosted.contains(&expert_id)
    }

    pub fn hosted_experts(&self) -> impl Iterator<Item = ExpertId> + '_ {
        self.hosted.iter().copied()
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Execute every pair of `request`.
    ///
    /// The whole request fails as a unit: an unhosted expert or a kernel
    /// error yields a `KernelError` batch with no results, and running past
    /// `timeout_ms` (when non-zero) yields `DeadlineExceeded`.
    pub fn handle(&self, request: &DispatchRequest) -> PartialResultBatch {
        self.stats.start_request();
        let started = Instant::now();
        let outcome = self.execute(request, started);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats.finish_request();

        match outcome {
            Ok(results) => {
                self.stats.record_success(results.len() as u64, elapsed_ms);
                debug!(
                    node = %self.node_id,
                    sequence = request.sequence,
                    pairs = results.len(),
                    elapsed_ms,
                    "Dispatch request completed"
                );
                PartialResultBatch::ok(request.sequence, request.layer, results)
            }
            Err((status, reason)) => {
                self.stats.record_failure(elapsed_ms);
                warn!(
                    node = %self.node_id,
                    sequence = request.sequence,
                    ?status,
                    %reason,
                    "Dispatch request failed"
                );
                PartialResultBatch::failed(request.sequence, request.layer, status, reason)
            }
        }
    }

    fn execute(
        &self,
        request: &DispatchRequest,
        started: Instant,
    ) -> std::result::Result<Vec<PartialResult>, (ResultStatus, String)> {
        let deadline = (request.timeout_ms > 0)
            .then(|| started + Duration::from_millis(request.timeout_ms as u64));

        // Entry indices per expert; BTreeMap keeps kernel order deterministic
        let mut by_expert: BTreeMap<ExpertId, Vec<usize>> = BTreeMap::new();
        for (idx, entry) in request.entries.iter().enumerate() {
            if !self.hosts(entry.expert_id) {
                return Err((
                    ResultStatus::KernelError,
                    format!("expert {} not hosted on {}", entry.expert_id, self.node_id),
                ));
            }
            by_expert.entry(entry.expert_id).or_default().push(idx);
        }

        let mut outputs: Vec<Option<Vec<f32>>> = vec![None; request.entries.len()];
        for (expert_id, indices) in by_expert {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err((
                    ResultStatus::DeadlineExceeded,
                    format!("deadline of {}ms passed before expert {}", request.timeout_ms, expert_id),
                ));
            }

            let width = request.entries[indices[0]].hidden_state.len();
            let rows: Vec<&[f32]> = indices
                .iter()
                .map(|&i| &request.entries[i].hidden_state[..])
                .collect();
            let input = TensorBuffer::from_rows(&rows, width)
                .map_err(|e| (ResultStatus::KernelError, e.to_string()))?;
            let output = self
                .kernel
                .run(expert_id, &input)
                .map_err(|e| (ResultStatus::KernelError, e.to_string()))?;
            if output.rows() != indices.len() {
                return Err((
                    ResultStatus::KernelError,
                    format!(
                        "expert {} returned {} rows for {} inputs",
                        expert_id,
                        output.rows(),
                        indices.len()
                    ),
                ));
            }

            for (row, &idx) in output.iter_rows().zip(&indices) {
                outputs[idx] = Some(row.to_vec());
            }
        }

        Ok(request
            .entries
            .iter()
            .zip(outputs)
            .filter_map(|(entry, output)| {
                output.map(|output| PartialResult {
                    token_id: entry.token_id,
                    expert_id: entry.expert_id,
                    sequence: request.sequence,
                    layer: request.layer,
                    output,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{MoeError, Result};
    use crate::kernel::AffineExpertKernel;
    use crate::network::DispatchEntry;

    fn entry(token_id: u64, expert_id: ExpertId, hidden: Vec<f32>) -> DispatchEntry {
        DispatchEntry {
            token_id,
            expert_id,
            hidden_state: hidden.into(),
        }
    }

    fn worker(hosted: Vec<ExpertId>) -> ExpertWorker {
        ExpertWorker::new(
            NodeId::new("node-a"),
            hosted,
            Arc::new(AffineExpertKernel::new(2)),
        )
    }

    #[test]
    fn test_results_follow_request_order() {
        let worker = worker(vec![0, 3]);
        let request = DispatchRequest {
            sequence: 5,
            layer: 2,
            timeout_ms: 0,
            entries: vec![
                entry(10, 3, vec![1.0, 2.0]),
                entry(11, 0, vec![1.0, 1.0]),
                entry(12, 3, vec![0.5, 0.0]),
            ],
        };

        let batch = worker.handle(&request);
        assert!(batch.is_ok());
        assert_eq!(batch.sequence, 5);
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.results[0].token_id, 10);
        assert_eq!(batch.results[0].output, vec![4.0, 8.0]);
        assert_eq!(batch.results[1].output, vec![1.0, 1.0]);
        assert_eq!(batch.results[2].output, vec![2.0, 0.0]);
        assert!(batch.results.iter().all(|r| r.layer == 2 && r.sequence == 5));

        assert_eq!(worker.stats().requests_completed.load(Ordering::Relaxed), 1);
        assert_eq!(worker.stats().pairs_computed.load(Ordering::Relaxed), 3);
        assert_eq!(worker.stats().active_requests(), 0);
    }

    #[test]
    fn test_unhosted_expert_fails_request() {
        let worker = worker(vec![0]);
        let request = DispatchRequest {
            sequence: 1,
            layer: 0,
            timeout_ms: 0,
            entries: vec![entry(1, 0, vec![1.0, 1.0]), entry(2, 7, vec![1.0, 1.0])],
        };

        let batch = worker.handle(&request);
        assert_eq!(batch.status, ResultStatus::KernelError);
        assert!(batch.error.unwrap().contains("expert 7"));
        assert!(batch.results.is_empty());
        assert_eq!(worker.stats().requests_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_kernel_dimension_error_is_reported() {
        let worker = worker(vec![1]);
        let request = DispatchRequest {
            sequence: 1,
            layer: 0,
            timeout_ms: 0,
            entries: vec![entry(1, 1, vec![1.0, 1.0, 1.0])],
        };
        let batch = worker.handle(&request);
        assert_eq!(batch.status, ResultStatus::KernelError);
    }

    struct SlowKernel;

    impl ExpertComputeKernel for SlowKernel {
        fn run(&self, _expert_id: ExpertId, hidden: &TensorBuffer) -> Result<TensorBuffer> {
            std::thread::sleep(Duration::from_millis(30));
            Ok(hidden.clone())
        }
    }

    #[test]
    fn test_deadline_between_experts() {
        let worker = ExpertWorker::new(NodeId::new("slow"), vec![0, 1], Arc::new(SlowKernel));
        let request = DispatchRequest {
            sequence: 1,
            layer: 0,
            timeout_ms: 10,
            entries: vec![entry(1, 0, vec![1.0]), entry(1, 1, vec![1.0])],
        };
        let batch = worker.handle(&request);
        assert_eq!(batch.status, ResultStatus::DeadlineExceeded);
    }

    struct FailingKernel;

    impl ExpertComputeKernel for FailingKernel {
        fn run(&self, expert_id: ExpertId, _hidden: &TensorBuffer) -> Result<TensorBuffer> {
            Err(MoeError::Kernel(format!("expert {expert_id} weights missing")))
        }
    }

    #[test]
    fn test_kernel_failure_message_propagates() {
        let worker = ExpertWorker::new(NodeId::new("bad"), vec![4], Arc::new(FailingKernel));
        let request = DispatchRequest {
            sequence: 2,
            layer: 0,
            timeout_ms: 0,
            entries: vec![entry(1, 4, vec![1.0])],
        };
        let batch = worker.handle(&request);
        assert_eq!(batch.status, ResultStatus::KernelError);
        assert!(batch.error.unwrap().contains("weights missing"));
    }
}
