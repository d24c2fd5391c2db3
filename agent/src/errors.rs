use crate::registry::NodeId;
use thiserror::Error;

/// Errors that can occur while routing, dispatching or aggregating MoE work.
#[derive(Error, Debug)]
pub enum MoeError {
    /// Hidden-state or tensor width does not match the model configuration.
    /// Always a caller bug; fatal for the call.
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Expert id is not present in the registry
    #[error("Unknown expert: {0}")]
    UnknownExpert(u32),

    /// Every replica of the expert is unreachable
    #[error("Expert {0} unavailable: all replicas unreachable")]
    ExpertUnavailable(u32),

    /// No expert required by a batch could be placed on any node
    #[error("Cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// Sending to or receiving from a node failed
    #[error("Transport failure to {node}: {reason}")]
    TransportFailure { node: NodeId, reason: String },

    /// A request or batch deadline elapsed
    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// Wire frame failed checksum or payload validation
    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    /// The forward pass was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Aggregated output was partial and the caller policy rejects partial output
    #[error("Degraded output: {missing} expert contributions missing")]
    DegradedOutput { missing: usize },

    /// Token id is not tracked by the aggregator
    #[error("Unknown token: {0}")]
    UnknownToken(u64),

    /// Expert compute kernel or gate projection failed
    #[error("Kernel error: {0}")]
    Kernel(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MoeError {
    /// Whether this error must abort the forward pass instead of degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MoeError::InvalidDimension { .. } | MoeError::ClusterUnavailable(_)
        )
    }

    pub(crate) fn transport(node: &NodeId, reason: impl Into<String>) -> Self {
        MoeError::TransportFailure {
            node: node.clone(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for MoE operations.
pub type Result<T> = std::result::Result<T, MoeError>;

impl From<toml::ser::Error> for MoeError {
    fn from(e: toml::ser::Error) -> Self {
        MoeError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for MoeError {
    fn from(e: toml::de::Error) -> Self {
        MoeError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for MoeError {
    fn from(e: serde_json::Error) -> Self {
        MoeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MoeError::InvalidDimension {
            expected: 64,
            actual: 32,
        };
        assert_eq!(err.to_string(), "Invalid dimension: expected 64, got 32");

        let err = MoeError::TransportFailure {
            node: NodeId::new("node-3"),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transport failure to node-3: connection refused"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let moe_err: MoeError = io_err.into();
        assert!(moe_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MoeError::InvalidDimension {
            expected: 1,
            actual: 2
        }
        .is_fatal());
        assert!(MoeError::ClusterUnavailable("no replicas".into()).is_fatal());
        assert!(!MoeError::ExpertUnavailable(3).is_fatal());
        assert!(!MoeError::DeadlineExceeded { elapsed_ms: 10 }.is_fatal());
        assert!(!MoeError::CorruptFrame("bad crc".into()).is_fatal());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
