//! Expert registry for tracking placement, node health and load
//!
//! Placement (expert → replica nodes) is fixed at construction; health and
//! load are per node and change at runtime. Every mutation happens under a
//! single write lock so `resolve` never returns a half-updated descriptor.

use crate::errors::{MoeError, Result};
use crate::routing::ExpertId;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::descriptor::{ExpertDescriptor, HealthState, NodeId, ReplicaStatus};

/// Per-node runtime state
#[derive(Debug, Clone)]
struct NodeEntry {
    health: HealthState,
    /// Cost of requests this coordinator has outstanding on the node
    pending: f64,
    /// Load last reported by the node itself
    reported: f64,
}

impl NodeEntry {
    fn load(&self) -> f64 {
        self.pending + self.reported
    }
}

impl Default for NodeEntry {
    fn default() -> Self {
        Self {
            health: HealthState::Healthy,
            pending: 0.0,
            reported: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, NodeEntry>,
    experts: BTreeMap<ExpertId, Vec<NodeId>>,
}

impl RegistryState {
    fn descriptor(&self, expert_id: ExpertId) -> Result<ExpertDescriptor> {
        let replicas = self
            .experts
            .get(&expert_id)
            .ok_or(MoeError::UnknownExpert(expert_id))?;

        let replicas: Vec<ReplicaStatus> = replicas
            .iter()
            .map(|node| {
                let entry = self.nodes.get(node).cloned().unwrap_or_default();
                ReplicaStatus {
                    node: node.clone(),
                    health: entry.health,
                    load_estimate: entry.load(),
                }
            })
            .collect();

        let health = replicas
            .iter()
            .map(|r| r.health)
            .min()
            .unwrap_or(HealthState::Unreachable);
        let load_estimate = replicas
            .iter()
            .filter(|r| r.health.is_dispatchable())
            .map(|r| r.load_estimate)
            .min_by(f64::total_cmp)
            .unwrap_or(0.0);

        Ok(ExpertDescriptor {
            expert_id,
            replicas,
            health,
            load_estimate,
        })
    }
}

/// First least-loaded replica in state `wanted`, skipping `excluded`
fn least_loaded(
    replicas: &[NodeId],
    nodes: &BTreeMap<NodeId, NodeEntry>,
    excluded: &[NodeId],
    wanted: HealthState,
) -> Option<NodeId> {
    replicas
        .iter()
        .filter(|node| !excluded.contains(*node))
        .filter_map(|node| nodes.get(node).map(|entry| (node, entry)))
        .filter(|(_, entry)| entry.health == wanted)
        .min_by(|(_, a), (_, b)| a.load().total_cmp(&b.load()))
        .map(|(node, _)| node.clone())
}

/// Registry of expert replicas and node health
pub struct ExpertRegistry {
    state: RwLock<RegistryState>,
}

impl ExpertRegistry {
    /// Build a registry from an expert → replica-set placement.
    ///
    /// All nodes start `Healthy` with zero load. Duplicate nodes inside a
    /// replica set are collapsed.
    pub fn new(placements: BTreeMap<ExpertId, Vec<NodeId>>) -> Result<Self> {
        let mut state = RegistryState::default();

        for (expert_id, replicas) in placements {
            let mut unique: Vec<NodeId> = Vec::with_capacity(replicas.len());
            for node in replicas {
                if !unique.contains(&node) {
                    unique.push(node);
                }
            }
            if unique.is_empty() {
                return Err(MoeError::Config(format!(
                    "expert {} has an empty replica set",
                    expert_id
                )));
            }
            for node in &unique {
                state.nodes.entry(node.clone()).or_default();
            }
            state.experts.insert(expert_id, unique);
        }

        info!(
            experts = state.experts.len(),
            nodes = state.nodes.len(),
            "Expert registry initialized"
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Descriptor snapshot for `expert_id`
    pub async fn resolve(&self, expert_id: ExpertId) -> Result<ExpertDescriptor> {
        self.state.read().await.descriptor(expert_id)
    }

    /// Pick the node that should serve `expert_id`.
    ///
    /// Least-loaded `Healthy` replica; otherwise the least-loaded `Degraded`
    /// replica; `ExpertUnavailable` when every replica is `Unreachable`.
    /// Equal loads resolve to placement order.
    pub async fn select_replica(&self, expert_id: ExpertId) -> Result<NodeId> {
        self.select_replica_excluding(expert_id, &[]).await
    }

    /// Same as [`select_replica`](Self::select_replica) but never returns a
    /// node from `excluded`. Used to find an alternate replica for a retry.
    pub async fn select_replica_excluding(
        &self,
        expert_id: ExpertId,
        excluded: &[NodeId],
    ) -> Result<NodeId> {
        let state = self.state.read().await;
        let replicas = state
            .experts
            .get(&expert_id)
            .ok_or(MoeError::UnknownExpert(expert_id))?;

        [HealthState::Healthy, HealthState::Degraded]
            .into_iter()
            .find_map(|wanted| least_loaded(replicas, &state.nodes, excluded, wanted))
            .ok_or(MoeError::ExpertUnavailable(expert_id))
    }

    /// Record a node health change. Returns the previous state, or `None` if
    /// the node is not part of any placement.
    pub async fn update_health(&self, node: &NodeId, health: HealthState) -> Option<HealthState> {
        let mut state = self.state.write().await;
        let Some(entry) = state.nodes.get_mut(node) else {
            warn!(node = %node, "Health update for unknown node");
            return None;
        };
        let previous = entry.health;
        entry.health = health;
        if previous != health {
            info!(node = %node, from = %previous, to = %health, "Node health changed");
        }
        Some(previous)
    }

    pub async fn node_health(&self, node: &NodeId) -> Option<HealthState> {
        self.state.read().await.nodes.get(node).map(|e| e.health)
    }

    /// All nodes that host at least one expert
    pub async fn nodes(&self) -> Vec<NodeId> {
        self.state.read().await.nodes.keys().cloned().collect()
    }

    pub async fn expert_ids(&self) -> Vec<ExpertId> {
        self.state.read().await.experts.keys().copied().collect()
    }

    /// Load feedback: `cost` units of work were sent to `node`
    pub async fn record_dispatch(&self, node: &NodeId, cost: f64) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.nodes.get_mut(node) {
            entry.pending += cost;
        }
    }

    /// Load feedback: `cost` units of work sent to `node` have finished
    /// (successfully or not)
    pub async fn record_completion(&self, node: &NodeId, cost: f64) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.nodes.get_mut(node) {
            entry.pending = (entry.pending - cost).max(0.0);
        }
    }

    /// Replace the load `node` reported about itself (health acks). Cost
    /// recorded through `record_dispatch` is kept on top of it.
    pub async fn update_load(&self, node: &NodeId, load: f64) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.nodes.get_mut(node) {
            debug!(node = %node, load = load, "Updated node load");
            entry.reported = load.max(0.0);
        }
    }

    pub async fn load_estimate(&self, node: &NodeId) -> Option<f64> {
        self.state.read().await.nodes.get(node).map(|e| e.load())
    }

    /// Descriptors for every registered expert, in expert id order
    pub async fn snapshot(&self) -> Vec<ExpertDescriptor> {
        let state = self.state.read().await;
        state
            .experts
            .keys()
            .filter_map(|id| state.descriptor(*id).ok())
            .collect()
    }
}
