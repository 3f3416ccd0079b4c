//! Shared request-handler state
//!
//! The generator is loaded once before the listener binds and is injected
//! into every handler through axum's `State` extractor.

use chatserve_common::config::LimitsConfig;
use chatserve_common::{ChatServeError, Result};
use chatserve_engine::{Generator, ModelInfo};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// State shared by all request handlers
#[derive(Clone)]
pub struct AppState {
    /// Loaded model and tokenizer
    generator: Arc<dyn Generator>,

    /// Bounds concurrent generations when configured
    limiter: Option<Arc<Semaphore>>,

    /// Serve `/metrics`
    metrics_enabled: bool,
}

impl AppState {
    /// Create handler state around a loaded generator
    pub fn new(generator: Arc<dyn Generator>, limits: &LimitsConfig, metrics_enabled: bool) -> Self {
        let limiter = match limits.max_concurrent_requests {
            0 => None,
            permits => Some(Arc::new(Semaphore::new(permits))),
        };

        Self {
            generator,
            limiter,
            metrics_enabled,
        }
    }

    /// Shared generator handle
    pub fn generator(&self) -> Arc<dyn Generator> {
        Arc::clone(&self.generator)
    }

    /// Served model description
    pub fn model_info(&self) -> &ModelInfo {
        self.generator.info()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    /// Wait for a generation slot; `None` when admission is unlimited
    pub async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        if limiter.available_permits() == 0 {
            debug!("All generation slots busy, waiting");
        }

        Arc::clone(limiter)
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| ChatServeError::generation("admission limiter closed"))
    }
}
