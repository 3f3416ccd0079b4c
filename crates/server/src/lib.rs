//! ChatServe Server
//!
//! HTTP front end that serves text completions from a single loaded model.

pub mod routes;
pub mod state;

pub use routes::{router, ChatRequest, ChatResponse, HealthResponse};
pub use state::AppState;
