//! Logging setup shared by the worker and bench commands

pub mod logging;

pub use logging::{default_log_dir, init_from_config, init_production_logging, init_simple_logging};
