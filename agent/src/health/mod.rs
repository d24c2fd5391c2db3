//! Node liveness probing
//!
//! [`NodeHealthMonitor`] probes every node on a fixed interval and runs each
//! outcome through a [`NodeHealthTracker`]. Only state transitions reach the
//! registry.

mod hysteresis;
mod monitor;

pub use hysteresis::NodeHealthTracker;
pub use monitor::{HealthConfig, NodeHealthMonitor};
