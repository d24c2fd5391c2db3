use crate::errors::Result;
use crate::registry::NodeId;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::messages::{DispatchRequest, HealthAck, PartialResultBatch};

/// Request/response channel to worker nodes.
///
/// Implementations must be safe to call concurrently for different and for
/// identical nodes. Responses are matched to requests by sequence number, so
/// a late response for an abandoned request is discarded, never delivered
/// to another caller.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Send a dispatch request and wait for its result batch.
    ///
    /// Callers bound the wait with their own timeout; dropping the returned
    /// future abandons the request.
    async fn send(&self, node: &NodeId, request: DispatchRequest) -> Result<PartialResultBatch>;

    /// Liveness probe used by the health monitor.
    async fn probe(&self, node: &NodeId) -> Result<HealthAck>;

    /// Counters shared by all connections of this transport
    fn stats(&self) -> &TransportStats;
}

/// Transport-level counters
#[derive(Debug, Default)]
pub struct TransportStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Frames dropped for checksum or payload errors
    pub corrupt_frames: AtomicU64,
    /// Responses whose sequence matched no waiting request
    pub unmatched_responses: AtomicU64,
    pub reconnects: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub corrupt_frames: u64,
    pub unmatched_responses: u64,
    pub reconnects: u64,
    pub send_failures: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}
