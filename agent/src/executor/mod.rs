//! Expert execution for worker nodes
//!
//! The expert_worker module runs dispatched (token, expert) pairs through the
//! node's compute kernel. It is driven by both transports.

pub mod expert_worker;

pub use expert_worker::{ExpertWorker, WorkerStats};
