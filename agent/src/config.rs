use crate::errors::{MoeError, Result};
use crate::health::HealthConfig;
use crate::inference::{DispatchConfig, DriverSettings};
use crate::network::{NetworkConfig, DEFAULT_MAX_FRAME_BYTES};
use crate::registry::NodeId;
use crate::routing::ExpertId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete runtime configuration of a cluster (`cluster.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Model architecture parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub expert_count: usize,
    pub top_k: usize,
    /// Number of MoE layers driven per forward pass
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Seed for the synthetic gate weights used by `bench`
    #[serde(default)]
    pub gate_seed: u64,
}

fn default_num_layers() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSection {
    pub request_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    pub max_inflight_per_node: usize,
    pub max_tokens_per_request: usize,
    /// Accept renormalized partial outputs instead of failing the layer
    pub accept_partial: bool,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 500,
            batch_timeout_ms: 2000,
            max_inflight_per_node: 4,
            max_tokens_per_request: 1024,
            accept_partial: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub health_check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 1000,
            probe_timeout_ms: 250,
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempts: u32,
    pub max_frame_bytes: usize,
    /// Concurrent dispatch requests a worker computes
    pub worker_concurrency: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            pool_size: 2,
            connect_timeout_ms: 2000,
            reconnect_base_ms: 50,
            reconnect_max_ms: 2000,
            reconnect_attempts: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            worker_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    /// Directory for rolling log files; `~/.moe-mesh/logs` when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Replicas per expert when placement is computed round-robin
    pub replication_factor: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
        }
    }
}

/// One worker node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    /// `host:port` the worker listens on
    pub address: String,
    /// Experts hosted by this node; computed from `[placement]` when no node
    /// lists any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experts: Vec<ExpertId>,
}

impl RuntimeConfig {
    /// Get default configuration file path: `~/.moe-mesh/cluster.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| MoeError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".moe-mesh").join("cluster.toml"))
    }

    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config = Self::from_toml_str(&content)?;
        tracing::info!(nodes = config.nodes.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.hidden_size == 0 {
            return Err(MoeError::Config("model.hidden_size must be at least 1".into()));
        }
        if m.expert_count == 0 {
            return Err(MoeError::Config("model.expert_count must be at least 1".into()));
        }
        if m.top_k == 0 || m.top_k > m.expert_count {
            return Err(MoeError::Config(format!(
                "model.top_k must be between 1 and expert_count ({})",
                m.expert_count
            )));
        }
        if m.num_layers == 0 {
            return Err(MoeError::Config("model.num_layers must be at least 1".into()));
        }

        let d = &self.dispatch;
        if d.request_timeout_ms == 0 {
            return Err(MoeError::Config("dispatch.request_timeout_ms must be positive".into()));
        }
        if d.batch_timeout_ms < d.request_timeout_ms {
            return Err(MoeError::Config(format!(
                "dispatch.batch_timeout_ms ({}) must be >= request_timeout_ms ({})",
                d.batch_timeout_ms, d.request_timeout_ms
            )));
        }
        if d.max_inflight_per_node == 0 {
            return Err(MoeError::Config("dispatch.max_inflight_per_node must be at least 1".into()));
        }
        if d.max_tokens_per_request == 0 {
            return Err(MoeError::Config("dispatch.max_tokens_per_request must be at least 1".into()));
        }

        let h = &self.health;
        if h.health_check_interval_ms == 0 || h.probe_timeout_ms == 0 {
            return Err(MoeError::Config("health intervals must be positive".into()));
        }
        if h.failure_threshold == 0 || h.recovery_threshold == 0 {
            return Err(MoeError::Config("health thresholds must be at least 1".into()));
        }

        let t = &self.transport;
        if t.pool_size == 0 || t.worker_concurrency == 0 {
            return Err(MoeError::Config(
                "transport.pool_size and worker_concurrency must be at least 1".into(),
            ));
        }
        if t.max_frame_bytes < 64 {
            return Err(MoeError::Config("transport.max_frame_bytes is too small".into()));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(MoeError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(MoeError::Config(format!("duplicate node id '{}'", node.id)));
            }
            if let Some(&e) = node.experts.iter().find(|&&e| e as usize >= m.expert_count) {
                return Err(MoeError::Config(format!(
                    "node '{}' lists expert {} but expert_count is {}",
                    node.id, e, m.expert_count
                )));
            }
        }

        if !self.nodes.is_empty() {
            let explicit = self.nodes.iter().any(|n| !n.experts.is_empty());
            if !explicit {
                let r = self.placement.replication_factor;
                if r == 0 || r > self.nodes.len() {
                    return Err(MoeError::Config(format!(
                        "placement.replication_factor must be between 1 and the node count ({})",
                        self.nodes.len()
                    )));
                }
            }
            let placements = self.placements();
            if let Some(missing) = (0..m.expert_count as ExpertId).find(|e| !placements.contains_key(e)) {
                return Err(MoeError::Config(format!("expert {} has no node", missing)));
            }
        }

        Ok(())
    }

    /// Expert → replica nodes, in placement order.
    ///
    /// Explicit `experts` lists win. Otherwise expert `e` is placed on nodes
    /// `e, e+1, … e+replication_factor-1` (mod node count).
    pub fn placements(&self) -> BTreeMap<ExpertId, Vec<NodeId>> {
        let mut placements: BTreeMap<ExpertId, Vec<NodeId>> = BTreeMap::new();
        if self.nodes.is_empty() {
            return placements;
        }

        if self.nodes.iter().any(|n| !n.experts.is_empty()) {
            for node in &self.nodes {
                for &expert in &node.experts {
                    placements
                        .entry(expert)
                        .or_default()
                        .push(NodeId::new(node.id.clone()));
                }
            }
            return placements;
        }

        let n = self.nodes.len();
        let replicas = self.placement.replication_factor.clamp(1, n);
        for expert in 0..self.model.expert_count {
            let nodes = (0..replicas)
                .map(|r| NodeId::new(self.nodes[(expert + r) % n].id.clone()))
                .collect();
            placements.insert(expert as ExpertId, nodes);
        }
        placements
    }

    /// Experts hosted by `node_id` under the current placement
    pub fn experts_for(&self, node_id: &str) -> Vec<ExpertId> {
        self.placements()
            .into_iter()
            .filter(|(_, nodes)| nodes.iter().any(|n| n.as_str() == node_id))
            .map(|(expert, _)| expert)
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn addresses(&self) -> HashMap<NodeId, String> {
        self.nodes
            .iter()
            .map(|n| (NodeId::new(n.id.clone()), n.address.clone()))
            .collect()
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            request_timeout: Duration::from_millis(self.dispatch.request_timeout_ms),
            batch_timeout: Duration::from_millis(self.dispatch.batch_timeout_ms),
            max_inflight_per_node: self.dispatch.max_inflight_per_node,
            max_tokens_per_request: self.dispatch.max_tokens_per_request,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.health.health_check_interval_ms),
            probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
            failure_threshold: self.health.failure_threshold,
            recovery_threshold: self.health.recovery_threshold,
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            pool_size: self.transport.pool_size,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            reconnect_base: Duration::from_millis(self.transport.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.transport.reconnect_max_ms),
            reconnect_attempts: self.transport.reconnect_attempts,
            max_frame_bytes: self.transport.max_frame_bytes,
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            hidden_size: self.model.hidden_size,
            expert_count: self.model.expert_count,
            top_k: self.model.top_k,
            accept_partial: self.dispatch.accept_partial,
        }
    }
}

impl Default for RuntimeConfig {
    /// Four local workers, 16 experts, two replicas each
    fn default() -> Self {
        Self {
            model: ModelConfig {
                hidden_size: 64,
                expert_count: 16,
                top_k: 2,
                num_layers: 4,
                gate_seed: 42,
            },
            dispatch: DispatchSection::default(),
            health: HealthSection::default(),
            transport: TransportSection::default(),
            logging: LoggingConfig::default(),
            placement: PlacementConfig {
                replication_factor: 2,
            },
            nodes: (0..4)
                .map(|i| NodeConfig {
                    id: format!("node-{i}"),
                    address: format!("127.0.0.1:{}", 7400 + i),
                    experts: Vec::new(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();

        let placements = config.placements();
        assert_eq!(placements.len(), 16);
        assert!(placements.values().all(|nodes| nodes.len() == 2));
        assert_eq!(
            placements[&5],
            vec![NodeId::new("node-1"), NodeId::new("node-2")]
        );
        assert_eq!(config.experts_for("node-0"), vec![0, 3, 4, 7, 8, 11, 12, 15]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cluster.toml");
        let config = RuntimeConfig::default();
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_minimal_file_uses_section_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [model]
            hidden_size = 8
            expert_count = 4
            top_k = 2

            [[nodes]]
            id = "w0"
            address = "10.0.0.1:7400"
            experts = [0, 1]

            [[nodes]]
            id = "w1"
            address = "10.0.0.2:7400"
            experts = [1, 2, 3]
            "#,
        )
        .unwrap();

        assert_eq!(config.model.num_layers, 1);
        assert_eq!(config.dispatch, DispatchSection::default());
        let placements = config.placements();
        assert_eq!(placements[&1], vec![NodeId::new("w0"), NodeId::new("w1")]);
        assert_eq!(config.experts_for("w1"), vec![1, 2, 3]);
        assert_eq!(config.addresses()[&NodeId::new("w0")], "10.0.0.1:7400");
    }

    #[test]
    fn test_batch_timeout_must_cover_request_timeout() {
        let mut config = RuntimeConfig::default();
        config.dispatch.batch_timeout_ms = 100;
        config.dispatch.request_timeout_ms = 200;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_timeout_ms"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = RuntimeConfig::default();
        config.model.top_k = 17;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.placement.replication_factor = 5;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.nodes[1].id = "node-0".into();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_unplaced_expert_rejected() {
        let result = RuntimeConfig::from_toml_str(
            r#"
            [model]
            hidden_size = 8
            expert_count = 3
            top_k = 1

            [[nodes]]
            id = "w0"
            address = "127.0.0.1:1"
            experts = [0, 1]
            "#,
        );
        assert!(matches!(result, Err(MoeError::Config(msg)) if msg.contains("expert 2")));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("[model\nhidden_size = 1"),
            Err(MoeError::Config(_))
        ));
    }

    #[test]
    fn test_conversions() {
        let config = RuntimeConfig::default();
        assert_eq!(
            config.dispatch_config().request_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.health_config().failure_threshold, 3);
        assert_eq!(config.network_config().pool_size, 2);
        let settings = config.driver_settings();
        assert_eq!((settings.hidden_size, settings.top_k), (64, 2));
    }
}
