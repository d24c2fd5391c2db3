use crate::routing::ExpertId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a worker node (as named in the cluster configuration)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Last-known health of a node, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Answering probes normally
    Healthy,
    /// Missing some probes; used only when no healthy replica exists
    Degraded,
    /// Not eligible for dispatch
    Unreachable,
}

impl HealthState {
    /// One step worse (saturates at `Unreachable`)
    pub fn demoted(self) -> Self {
        match self {
            HealthState::Healthy => HealthState::Degraded,
            _ => HealthState::Unreachable,
        }
    }

    /// One step better (saturates at `Healthy`)
    pub fn promoted(self) -> Self {
        match self {
            HealthState::Unreachable => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }

    pub fn is_dispatchable(self) -> bool {
        self != HealthState::Unreachable
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Unreachable => "UNREACHABLE",
        };
        f.write_str(s)
    }
}

/// State of one replica of an expert at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub node: NodeId,
    pub health: HealthState,
    pub load_estimate: f64,
}

/// Consistent snapshot of an expert's placement and health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertDescriptor {
    pub expert_id: ExpertId,
    /// Replica set in placement order (never empty)
    pub replicas: Vec<ReplicaStatus>,
    /// Best health among the replicas
    pub health: HealthState,
    /// Lowest load among dispatchable replicas, or 0.0 if none
    pub load_estimate: f64,
}

impl ExpertDescriptor {
    pub fn replica_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.replicas.iter().map(|r| &r.node)
    }

    pub fn healthy_replicas(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.health == HealthState::Healthy)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions_saturate() {
        assert_eq!(HealthState::Healthy.demoted(), HealthState::Degraded);
        assert_eq!(HealthState::Degraded.demoted(), HealthState::Unreachable);
        assert_eq!(HealthState::Unreachable.demoted(), HealthState::Unreachable);

        assert_eq!(HealthState::Unreachable.promoted(), HealthState::Degraded);
        assert_eq!(HealthState::Degraded.promoted(), HealthState::Healthy);
        assert_eq!(HealthState::Healthy.promoted(), HealthState::Healthy);
    }

    #[test]
    fn test_health_ordering() {
        assert!(HealthState::Healthy < HealthState::Degraded);
        assert!(HealthState::Degraded < HealthState::Unreachable);
        assert!(!HealthState::Unreachable.is_dispatchable());
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_string(&HealthState::Unreachable).unwrap();
        assert_eq!(json, "\"UNREACHABLE\"");
        let node: NodeId = serde_json::from_str("\"node-7\"").unwrap();
        assert_eq!(node, NodeId::new("node-7"));
    }
}
