//! Distributed Mixture-of-Experts routing and inference coordination.
//!
//! A coordinator routes each token to its top-k experts, dispatches the work
//! to the worker nodes that host those experts and combines the weighted
//! partial results, tolerating slow or failed nodes.

pub mod cancel;
pub mod config;
pub mod errors;
pub mod executor;
pub mod health;
pub mod inference;
pub mod kernel;
pub mod network;
pub mod observability;
pub mod registry;
pub mod routing;
pub mod tensor;

pub use cancel::CancelToken;
pub use config::{LoggingConfig, NodeConfig, RuntimeConfig};
pub use errors::{MoeError, Result};
pub use executor::{ExpertWorker, WorkerStats};
pub use health::{HealthConfig, NodeHealthMonitor, NodeHealthTracker};
pub use inference::{
    Aggregator, CombinedOutput, Delivery, DispatchConfig, DispatchCoordinator, DriverSettings,
    ForwardDriver, ForwardOutput, MoeStats, MoeStatsSnapshot, OutputStatus, PendingBatch,
};
pub use kernel::{AffineExpertKernel, ExpertComputeKernel, GateProjection, LinearGate};
pub use network::{
    ClusterTransport, InProcessTransport, NetworkConfig, NetworkTransport, NodeBehavior,
    WorkerServer,
};
pub use observability::{init_from_config, init_production_logging, init_simple_logging};
pub use registry::{ExpertDescriptor, ExpertRegistry, HealthState, NodeId, ReplicaStatus};
pub use routing::{ExpertId, ExpertSelection, RoutingDecision, Router, Token, TokenId};
pub use tensor::TensorBuffer;
