//! Inference module for distributed MoE layers
//!
//! This module provides the coordination layer that turns routed tokens into
//! combined layer outputs across a cluster of expert workers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             ForwardDriver               │
//! │  • One Router per MoE layer             │
//! │  • Applies the partial-output policy    │
//! └─────────────────────────────────────────┘
//!       │ routing decisions
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │          DispatchCoordinator            │
//! │  • Groups pairs per node, sequences     │
//! │  • Per-node in-flight window            │
//! │  • Retry on alternate replica / skip    │
//! └─────────────────────────────────────────┘
//!       │ Delivery messages
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │              Aggregator                 │
//! │  • Weighted sum per token               │
//! │  • Deadline, renormalization, Partial   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The coordinator and the aggregator share no mutable state; they only
//! exchange [`Delivery`] messages.

pub mod aggregator;
pub mod dispatch;
pub mod forward;
pub mod stats;

pub use aggregator::{Aggregator, CombinedOutput, Delivery, DeliverySink, OutputStatus};
pub use dispatch::{DispatchConfig, DispatchCoordinator, PendingBatch};
pub use forward::{DriverSettings, ForwardDriver, ForwardOutput};
pub use stats::{MoeStats, MoeStatsSnapshot};
