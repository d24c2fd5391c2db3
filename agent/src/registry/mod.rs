//! Expert placement and health registry
//!
//! The [`ExpertRegistry`] is the only structure mutated concurrently by
//! several components: the health monitor publishes node state changes and
//! the dispatch coordinator reports load. Both go through a reader-writer
//! lock, so a reader always sees a complete descriptor.

mod descriptor;
mod expert_registry;

pub use descriptor::{ExpertDescriptor, HealthState, NodeId, ReplicaStatus};
pub use expert_registry::ExpertRegistry;
