use crate::cancel::CancelToken;
use crate::network::ClusterTransport;
use crate::registry::{ExpertRegistry, HealthState, NodeId};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::hysteresis::NodeHealthTracker;

/// Probe cadence and hysteresis thresholds
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(250),
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// Periodically probes every node known to the registry and publishes
/// health transitions to it.
///
/// Runs beside dispatch and only touches the registry through its lock, so
/// probing never blocks a forward pass.
pub struct NodeHealthMonitor {
    registry: Arc<ExpertRegistry>,
    transport: Arc<dyn ClusterTransport>,
    config: HealthConfig,
    trackers: Mutex<HashMap<NodeId, NodeHealthTracker>>,
}

impl NodeHealthMonitor {
    pub fn new(
        registry: Arc<ExpertRegistry>,
        transport: Arc<dyn ClusterTransport>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe every node once, concurrently. Acknowledged in-flight counts
    /// become the nodes' reported load. Returns the health transitions that
    /// were published to the registry.
    pub async fn probe_once(&self) -> Vec<(NodeId, HealthState)> {
        let nodes = self.registry.nodes().await;
        let probes = nodes.into_iter().map(|node| async move {
            let outcome = tokio::time::timeout(self.config.probe_timeout, self.transport.probe(&node)).await;
            let inflight = match outcome {
                Ok(Ok(ack)) => {
                    debug!(node = %node, inflight = ack.inflight, "Probe acknowledged");
                    Some(ack.inflight)
                }
                Ok(Err(e)) => {
                    debug!(node = %node, error = %e, "Probe failed");
                    None
                }
                Err(_) => {
                    debug!(node = %node, "Probe timed out");
                    None
                }
            };
            (node, inflight)
        });
        let results = join_all(probes).await;

        let mut changes = Vec::new();
        let mut trackers = self.trackers.lock().await;
        for (node, inflight) in results {
            let success = inflight.is_some();
            if let Some(inflight) = inflight {
                self.registry.update_load(&node, f64::from(inflight)).await;
            }
            if !trackers.contains_key(&node) {
                let initial = self
                    .registry
                    .node_health(&node)
                    .await
                    .unwrap_or(HealthState::Healthy);
                trackers.insert(
                    node.clone(),
                    NodeHealthTracker::new(
                        initial,
                        self.config.failure_threshold,
                        self.config.recovery_threshold,
                    ),
                );
            }
            let Some(tracker) = trackers.get_mut(&node) else {
                continue;
            };

            if let Some(state) = tracker.record(success) {
                if state == HealthState::Healthy {
                    info!(node = %node, %state, "Node recovered");
                } else {
                    warn!(node = %node, %state, "Node health degraded");
                }
                self.registry.update_health(&node, state).await;
                changes.push((node, state));
            }
        }
        changes
    }

    /// Current tracked state of `node`, if it has been probed
    pub async fn state(&self, node: &NodeId) -> Option<HealthState> {
        self.trackers.lock().await.get(node).map(|t| t.state())
    }

    /// Probe on every interval tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            failure_threshold = self.config.failure_threshold,
            recovery_threshold = self.config.recovery_threshold,
            "Starting node health monitor"
        );

        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Health monitor stopped");
                    return;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExpertWorker;
    use crate::kernel::AffineExpertKernel;
    use crate::network::{InProcessTransport, NodeBehavior};
    use std::collections::BTreeMap;

    async fn cluster() -> (Arc<ExpertRegistry>, Arc<InProcessTransport>) {
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let mut placements = BTreeMap::new();
        placements.insert(0, vec![a.clone(), b.clone()]);
        let registry = Arc::new(ExpertRegistry::new(placements).unwrap());

        let kernel = Arc::new(AffineExpertKernel::new(2));
        let transport = Arc::new(
            InProcessTransport::with_workers([
                ExpertWorker::new(a, vec![0], kernel.clone()),
                ExpertWorker::new(b, vec![0], kernel),
            ])
            .await,
        );
        (registry, transport)
    }

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(20),
            failure_threshold: 2,
            recovery_threshold: 2,
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_is_demoted_and_recovers() {
        let (registry, transport) = cluster().await;
        let monitor = NodeHealthMonitor::new(registry.clone(), transport.clone(), config());
        let b = NodeId::new("b");

        transport
            .set_behavior(&b, NodeBehavior::Unreachable)
            .await
            .unwrap();
        assert!(monitor.probe_once().await.is_empty());
        assert_eq!(
            monitor.probe_once().await,
            vec![(b.clone(), HealthState::Degraded)]
        );
        monitor.probe_once().await;
        monitor.probe_once().await;
        assert_eq!(registry.node_health(&b).await, Some(HealthState::Unreachable));
        assert_eq!(registry.node_health(&NodeId::new("a")).await, Some(HealthState::Healthy));

        transport.set_behavior(&b, NodeBehavior::Healthy).await.unwrap();
        for _ in 0..4 {
            monitor.probe_once().await;
        }
        assert_eq!(registry.node_health(&b).await, Some(HealthState::Healthy));
        assert_eq!(monitor.state(&b).await, Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn test_ack_inflight_becomes_reported_load() {
        let (registry, transport) = cluster().await;
        let monitor = NodeHealthMonitor::new(registry.clone(), transport.clone(), config());
        let a = NodeId::new("a");
        registry.update_load(&a, 7.0).await;

        // Idle workers acknowledge with zero requests in flight
        assert!(monitor.probe_once().await.is_empty());
        assert_eq!(registry.load_estimate(&a).await, Some(0.0));
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let (registry, transport) = cluster().await;
        let monitor = NodeHealthMonitor::new(registry.clone(), transport.clone(), config());
        let a = NodeId::new("a");
        transport
            .set_behavior(&a, NodeBehavior::DropResponses)
            .await
            .unwrap();

        monitor.probe_once().await;
        monitor.probe_once().await;
        assert_eq!(registry.node_health(&a).await, Some(HealthState::Degraded));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (registry, transport) = cluster().await;
        let monitor = Arc::new(NodeHealthMonitor::new(registry.clone(), transport.clone(), config()));
        transport
            .set_behavior(&NodeId::new("b"), NodeBehavior::Unreachable)
            .await
            .unwrap();

        let shutdown = CancelToken::new();
        let handle = monitor.clone().spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_ne!(
            registry.node_health(&NodeId::new("b")).await,
            Some(HealthState::Healthy)
        );
    }
}
