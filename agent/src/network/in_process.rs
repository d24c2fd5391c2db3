//! Loopback transport for tests, benchmarks and single-process clusters.
//!
//! Every request and response is encoded to wire bytes and decoded again, so
//! the codec is exercised exactly as over TCP. Per-node [`NodeBehavior`]
//! injects failures at runtime.

use crate::errors::{MoeError, Result};
use crate::executor::ExpertWorker;
use crate::registry::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::trace;

use super::frame::Frame;
use super::messages::{DispatchRequest, HealthAck, HealthProbe, Message, PartialResultBatch};
use super::transport::{ClusterTransport, TransportStats};

/// Fault injected for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeBehavior {
    #[default]
    Healthy,
    /// Every call fails immediately, like a refused connection
    Unreachable,
    /// Requests and probes are answered after the given delay
    Delay(Duration),
    /// Requests are accepted but never answered
    DropResponses,
    /// Responses arrive with a bad checksum and are discarded
    CorruptResponses,
}

struct LoopbackNode {
    worker: ExpertWorker,
    behavior: NodeBehavior,
    /// Sequence numbers in arrival order
    sequences: Vec<u64>,
}

/// [`ClusterTransport`] that calls [`ExpertWorker`]s in the same process.
pub struct InProcessTransport {
    nodes: RwLock<HashMap<NodeId, LoopbackNode>>,
    next_nonce: AtomicU64,
    stats: TransportStats,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            stats: TransportStats::new(),
        }
    }

    /// Build a transport hosting `workers`, all healthy.
    pub async fn with_workers(workers: impl IntoIterator<Item = ExpertWorker>) -> Self {
        let transport = Self::new();
        for worker in workers {
            transport.add_worker(worker).await;
        }
        transport
    }

    /// Register (or replace) the worker for its node.
    pub async fn add_worker(&self, worker: ExpertWorker) {
        let node = worker.node_id().clone();
        self.nodes.write().await.insert(
            node,
            LoopbackNode {
                worker,
                behavior: NodeBehavior::Healthy,
                sequences: Vec::new(),
            },
        );
    }

    pub async fn set_behavior(&self, node: &NodeId, behavior: NodeBehavior) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| MoeError::transport(node, "unknown node"))?;
        entry.behavior = behavior;
        Ok(())
    }

    /// Sequence numbers received by `node`, in arrival order
    pub async fn sequences_seen(&self, node: &NodeId) -> Vec<u64> {
        self.nodes
            .read()
            .await
            .get(node)
            .map(|n| n.sequences.clone())
            .unwrap_or_default()
    }

    /// Encode, decode and unwrap a message as if it crossed a socket
    fn over_wire(&self, message: Message) -> Result<Message> {
        let bytes = message.to_frame().encode();
        let (frame, _) = Frame::decode(&bytes)?;
        Message::from_frame(&frame)
    }

    async fn lookup(&self, node: &NodeId) -> Result<(ExpertWorker, NodeBehavior)> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(node)
            .ok_or_else(|| MoeError::transport(node, "unknown node"))?;
        Ok((entry.worker.clone(), entry.behavior))
    }

    async fn apply_behavior(&self, node: &NodeId, behavior: NodeBehavior) -> Result<()> {
        match behavior {
            NodeBehavior::Healthy => Ok(()),
            NodeBehavior::Unreachable => {
                self.stats.record_send_failure();
                Err(MoeError::transport(node, "connection refused"))
            }
            NodeBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            NodeBehavior::DropResponses => std::future::pending().await,
            NodeBehavior::CorruptResponses => Ok(()),
        }
    }

    /// Carry a response back from the worker, damaging it first when the
    /// node is set to corrupt responses. A damaged frame fails its checksum,
    /// is counted and never reaches the caller, as with a real connection.
    async fn respond(
        &self,
        node: &NodeId,
        behavior: NodeBehavior,
        message: Message,
    ) -> Result<Message> {
        if behavior != NodeBehavior::CorruptResponses {
            return self.over_wire(message);
        }

        let mut bytes = message.to_frame().encode();
        // First payload byte; the type byte stays valid
        let idx = 5.min(bytes.len() - 1);
        bytes[idx] ^= 0x5A;
        match Frame::decode(&bytes) {
            Err(MoeError::CorruptFrame(reason)) => {
                self.stats.record_corrupt();
                trace!(node = %node, %reason, "Dropped corrupt loopback response");
                std::future::pending().await
            }
            Err(e) => Err(e),
            Ok((frame, _)) => Message::from_frame(&frame),
        }
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterTransport for InProcessTransport {
    async fn send(&self, node: &NodeId, request: DispatchRequest) -> Result<PartialResultBatch> {
        let (worker, behavior) = self.lookup(node).await?;
        if behavior == NodeBehavior::Unreachable {
            self.stats.record_send_failure();
            return Err(MoeError::transport(node, "connection refused"));
        }

        if let Some(entry) = self.nodes.write().await.get_mut(node) {
            entry.sequences.push(request.sequence);
        }

        let request = match self.over_wire(Message::Dispatch(request))? {
            Message::Dispatch(req) => req,
            other => {
                return Err(MoeError::CorruptFrame(format!(
                    "expected dispatch request, decoded {:?}",
                    other.kind()
                )))
            }
        };
        self.stats.record_sent();
        trace!(node = %node, sequence = request.sequence, pairs = request.len(), "Loopback dispatch");

        let batch = tokio::task::spawn_blocking(move || worker.handle(&request))
            .await
            .map_err(|e| MoeError::transport(node, format!("worker task failed: {e}")))?;

        self.apply_behavior(node, behavior).await?;

        match self.respond(node, behavior, Message::Results(batch)).await? {
            Message::Results(batch) => {
                self.stats.record_received();
                Ok(batch)
            }
            other => Err(MoeError::CorruptFrame(format!(
                "expected partial result, decoded {:?}",
                other.kind()
            ))),
        }
    }

    async fn probe(&self, node: &NodeId) -> Result<HealthAck> {
        let (worker, behavior) = self.lookup(node).await?;
        self.apply_behavior(node, behavior).await?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let Message::Probe(probe) = self.over_wire(Message::Probe(HealthProbe { nonce }))? else {
            return Err(MoeError::CorruptFrame("probe decoded as another type".into()));
        };
        let ack = HealthAck {
            nonce: probe.nonce,
            inflight: worker.stats().active_requests() as u32,
            hosted_experts: worker.hosted_experts().count() as u32,
        };
        match self.respond(node, behavior, Message::Ack(ack)).await? {
            Message::Ack(ack) => Ok(ack),
            other => Err(MoeError::CorruptFrame(format!(
                "expected health ack, decoded {:?}",
                other.kind()
            ))),
        }
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::AffineExpertKernel;
    use crate::network::{DispatchEntry, ResultStatus};
    use std::sync::Arc;

    fn worker(id: &str, experts: Vec<u32>) -> ExpertWorker {
        ExpertWorker::new(NodeId::new(id), experts, Arc::new(AffineExpertKernel::new(2)))
    }

    fn request(sequence: u64, expert_id: u32) -> DispatchRequest {
        DispatchRequest {
            sequence,
            layer: 0,
            timeout_ms: 0,
            entries: vec![DispatchEntry {
                token_id: 1,
                expert_id,
                hidden_state: vec![1.0f32, -2.0].into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_send_runs_worker() {
        let transport = InProcessTransport::with_workers([worker("a", vec![1])]).await;
        let node = NodeId::new("a");

        let batch = transport.send(&node, request(1, 1)).await.unwrap();
        assert_eq!(batch.status, ResultStatus::Ok);
        assert_eq!(batch.results[0].output, vec![2.0, -4.0]);
        assert_eq!(transport.sequences_seen(&node).await, vec![1]);

        let snap = transport.stats().snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_received, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_nodes_fail() {
        let transport = InProcessTransport::with_workers([worker("a", vec![0])]).await;
        assert!(matches!(
            transport.send(&NodeId::new("zz"), request(1, 0)).await,
            Err(MoeError::TransportFailure { .. })
        ));

        let node = NodeId::new("a");
        transport
            .set_behavior(&node, NodeBehavior::Unreachable)
            .await
            .unwrap();
        assert!(transport.send(&node, request(1, 0)).await.is_err());
        assert!(transport.probe(&node).await.is_err());
        assert!(transport.sequences_seen(&node).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_responses_never_resolve() {
        let transport = InProcessTransport::with_workers([worker("a", vec![0])]).await;
        let node = NodeId::new("a");
        transport
            .set_behavior(&node, NodeBehavior::DropResponses)
            .await
            .unwrap();

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            transport.send(&node, request(1, 0)),
        )
        .await;
        assert!(res.is_err(), "dropped response should time out");
    }

    #[tokio::test]
    async fn test_probe_reports_hosted_experts() {
        let transport = InProcessTransport::with_workers([worker("a", vec![0, 3, 5])]).await;
        let first = transport.probe(&NodeId::new("a")).await.unwrap();
        let second = transport.probe(&NodeId::new("a")).await.unwrap();
        assert_eq!(first.hosted_experts, 3);
        assert_eq!(first.inflight, 0);
        assert_ne!(first.nonce, second.nonce);
    }

    #[tokio::test]
    async fn test_corrupt_responses_fail_checksum_and_never_resolve() {
        let transport = InProcessTransport::with_workers([worker("a", vec![0])]).await;
        let node = NodeId::new("a");
        transport
            .set_behavior(&node, NodeBehavior::CorruptResponses)
            .await
            .unwrap();

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            transport.send(&node, request(1, 0)),
        )
        .await;
        assert!(res.is_err(), "corrupt response must not reach the caller");
        let probe = tokio::time::timeout(Duration::from_millis(50), transport.probe(&node)).await;
        assert!(probe.is_err());

        let snap = transport.stats().snapshot();
        assert_eq!(snap.corrupt_frames, 2);
        assert_eq!(snap.frames_received, 0);
        // The worker still ran the request before its reply was damaged
        assert_eq!(transport.sequences_seen(&node).await, vec![1]);
    }
}
