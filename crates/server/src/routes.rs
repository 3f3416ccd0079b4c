//! HTTP routes
//!
//! `POST /chat` turns a message into a completion. `GET /health` and
//! `GET /metrics` report on the running service.

use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatserve_common::{ChatServeError, LatencyTimer, Result, METRICS};
use chatserve_engine::ModelInfo;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Chat request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Chat response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// Health response body
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,

    #[serde(flatten)]
    pub model: ModelInfo,
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Keeps the active-request gauge accurate on every exit path
struct ActiveRequest;

impl ActiveRequest {
    fn enter() -> Self {
        METRICS.inference.active_requests.inc();
        ActiveRequest
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        METRICS.inference.active_requests.dec();
    }
}

async fn chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>> {
    let Json(request) = payload.map_err(|rejection| {
        METRICS.server.requests_rejected.inc();
        ChatServeError::validation(rejection.body_text())
    })?;

    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);

    async move {
        let start = Instant::now();
        METRICS.inference.requests_total.inc();
        let _active = ActiveRequest::enter();

        let result = complete(&state, request.message).await;

        METRICS.inference.request_duration.observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => METRICS.inference.requests_success.inc(),
            Err(e) => {
                METRICS.inference.requests_failed.inc();
                warn!("Chat request failed: {}", e);
            }
        }

        result.map(|reply| Json(ChatResponse { reply }))
    }
    .instrument(span)
    .await
}

async fn complete(state: &AppState, message: String) -> Result<String> {
    let _permit = state.admit().await?;

    let generator = state.generator();
    let span = Span::current();

    let (completion, elapsed) = tokio::task::spawn_blocking(move || {
        span.in_scope(|| {
            METRICS
                .inference
                .generation_duration
                .observe_duration(|| generator.generate(&message))
        })
    })
    .await
    .map_err(|e| ChatServeError::generation(format!("generation task aborted: {}", e)))?;
    let completion = completion?;

    METRICS.inference.prompt_tokens_total.inc_by(completion.prompt_tokens as u64);
    METRICS.inference.tokens_generated_total.inc_by(completion.generated_tokens as u64);
    if completion.generated_tokens > 0 {
        METRICS
            .inference
            .tokens_per_second
            .observe(completion.generated_tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON));
    }

    info!(
        "Completed: prompt_tokens={}, generated_tokens={}, finish={:?}",
        completion.prompt_tokens, completion.generated_tokens, completion.finish_reason
    );

    Ok(completion.text)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.model_info().clone(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chatserve_common::config::LimitsConfig;
    use chatserve_engine::{Architecture, Completion, DeviceKind, ExecutionConfig, FinishReason, Generator, Precision};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_info() -> ModelInfo {
        ModelInfo::new(
            "gemma-2b",
            Architecture::Gemma,
            ExecutionConfig {
                device: DeviceKind::Cpu,
                precision: Precision::F32,
            },
        )
    }

    /// Replies with the prompt followed by a fixed continuation
    struct EchoGenerator {
        info: ModelInfo,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl EchoGenerator {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                info: test_info(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl Generator for EchoGenerator {
        fn generate(&self, prompt: &str) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(Completion {
                text: format!("{} and then some", prompt),
                prompt_tokens: 1,
                generated_tokens: 3,
                finish_reason: FinishReason::Eos,
            })
        }

        fn info(&self) -> &ModelInfo {
            &self.info
        }
    }

    struct FailingGenerator {
        info: ModelInfo,
    }

    impl Generator for FailingGenerator {
        fn generate(&self, _prompt: &str) -> Result<Completion> {
            Err(ChatServeError::generation("CUDA out of memory"))
        }

        fn info(&self) -> &ModelInfo {
            &self.info
        }
    }

    fn app(generator: Arc<dyn Generator>, max_concurrent_requests: usize) -> Router {
        let limits = LimitsConfig {
            max_concurrent_requests,
        };
        router(AppState::new(generator, &limits, true))
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_returns_reply() {
        let generator = Arc::new(EchoGenerator::new());
        let response = app(generator.clone(), 0)
            .oneshot(chat_request(r#"{"message": "Hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reply"], "Hello and then some");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chat_records_throughput() {
        let before = METRICS.inference.tokens_per_second.get_sample_count();

        let response = app(Arc::new(EchoGenerator::new()), 0)
            .oneshot(chat_request(r#"{"message": "Hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(METRICS.inference.tokens_per_second.get_sample_count() > before);
    }

    #[tokio::test]
    async fn test_empty_message_is_accepted() {
        let response = app(Arc::new(EchoGenerator::new()), 0)
            .oneshot(chat_request(r#"{"message": ""}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["reply"].is_string());
    }

    #[tokio::test]
    async fn test_missing_message_is_rejected_before_model() {
        let generator = Arc::new(EchoGenerator::new());
        let response = app(generator.clone(), 0)
            .oneshot(chat_request(r#"{"text": "Hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["detail"].is_string());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_string_message_is_rejected() {
        let generator = Arc::new(EchoGenerator::new());
        let response = app(generator.clone(), 0)
            .oneshot(chat_request(r#"{"message": 42}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let response = app(Arc::new(EchoGenerator::new()), 0)
            .oneshot(chat_request(r#"{"message": "#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_generation_failure_is_server_error() {
        let generator = Arc::new(FailingGenerator { info: test_info() });
        let response = app(generator, 0)
            .oneshot(chat_request(r#"{"message": "Hello"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["detail"], "Internal server error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_keep_their_own_input() {
        let generator = Arc::new(EchoGenerator::with_delay(Duration::from_millis(5)));
        let app = app(generator.clone(), 0);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    let body = serde_json::json!({ "message": format!("message {}", i) }).to_string();
                    let response = app.oneshot(chat_request(&body)).await.unwrap();
                    (i, response.status(), body_json(response).await)
                })
            })
            .collect();

        for handle in handles {
            let (i, status, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["reply"], format!("message {} and then some", i));
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_limit_bounds_concurrency() {
        let generator = Arc::new(EchoGenerator::with_delay(Duration::from_millis(20)));
        let app = app(generator.clone(), 2);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    let body = serde_json::json!({ "message": format!("m{}", i) }).to_string();
                    app.oneshot(chat_request(&body)).await.unwrap().status()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }
        assert!(generator.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_health_reports_model() {
        let response = app(Arc::new(EchoGenerator::new()), 0)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model_id"], "gemma-2b");
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["precision"], "f32");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = app(Arc::new(EchoGenerator::new()), 0)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("chat_requests_total"));
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let state = AppState::new(
            Arc::new(EchoGenerator::new()),
            &LimitsConfig::default(),
            false,
        );
        let response = router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
