//! ChatServe common library
//!
//! This crate contains shared code used across ChatServe components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use crate::config::ServerConfig;
pub use error::{ChatServeError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
