//! Control REST endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use voice_gateway_core::metrics;
use voice_gateway_telephony::{Gateway, TelephonyError};

use crate::metrics::metrics_handler;

/// Shared state of the control REST.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub authorization_token: Option<String>,
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/call", post(place_call))
        .route("/transfer/:session_id", post(transfer))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Bearer check against the configured token. 401 when the header is
/// missing, 403 on mismatch.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = &state.authorization_token else {
        return Ok(());
    };
    let Some(header) = headers.get("Authorization").and_then(|v| v.to_str().ok()) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "missing authorization"})),
        ));
    };
    if header != format!("Bearer {expected}") {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"message": "invalid authorization"})),
        ));
    }
    Ok(())
}

async fn place_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    metrics::increment_request();
    let started = Instant::now();
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let Some(to_uri) = body.get("to_uri").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "to_uri is required"})),
        );
    };
    let env_info = body
        .get("env_info")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    let communication_id = body
        .get("communication_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let result = state
        .gateway
        .place_call(to_uri, env_info, communication_id)
        .await;
    metrics::observe_response_time("call", started.elapsed().as_secs_f64());
    metrics::observe_response_summary("call", started.elapsed().as_secs_f64());

    match result {
        Ok(placed) => (
            StatusCode::OK,
            Json(json!({"message": "ok", "session_id": placed.session_id})),
        ),
        Err(TelephonyError::SipUnavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "sip not initialized"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to handle /call request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"message": "failed to start session"})),
            )
        }
    }
}

async fn transfer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    metrics::increment_request();
    let started = Instant::now();
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let Some(to_uri) = body.get("to_uri").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "to_uri is required"})),
        );
    };
    let transfer_delay = body
        .get("transfer_delay")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);

    let result = state.gateway.transfer(&session_id, to_uri, transfer_delay);
    metrics::observe_response_time("transfer", started.elapsed().as_secs_f64());
    metrics::observe_response_summary("transfer", started.elapsed().as_secs_f64());

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "message": "Successfully transferred",
                "session_id": session_id,
                "to_uri": to_uri,
            })),
        ),
        Err(TelephonyError::SessionNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "session not found"})),
        ),
        Err(TelephonyError::CallNotActive) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "call is not active"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, session_id = %session_id, "Failed to handle /transfer request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"message": "transfer failed"})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path as FsPath;
    use tower::ServiceExt;
    use voice_gateway_backend::{
        BackendError, CommitResponse, CreateSessionRequest, CreatedSession, GenerationBackend,
    };
    use voice_gateway_config::Settings;
    use voice_gateway_pipeline::player::{MediaPlayback, PlaybackHandle};
    use voice_gateway_pipeline::vad::SpeechEstimator;
    use voice_gateway_pipeline::PipelineError;
    use voice_gateway_telephony::{CallActions, SipStack};

    struct FakeBackend {
        fail_create: bool,
    }

    #[async_trait]
    impl GenerationBackend for FakeBackend {
        async fn capabilities(&self) -> Result<Value, BackendError> {
            Ok(json!({}))
        }
        async fn create_session(
            &self,
            _r: CreateSessionRequest,
        ) -> Result<CreatedSession, BackendError> {
            if self.fail_create {
                return Err(BackendError::Status {
                    status: 500,
                    message: "backend down".to_string(),
                });
            }
            Ok(CreatedSession {
                session_id: "sess-1".to_string(),
                greeting: None,
            })
        }
        async fn start(&self, _s: &str, _m: &str) -> Result<Value, BackendError> {
            Ok(json!({}))
        }
        async fn commit(&self, _s: &str) -> Result<CommitResponse, BackendError> {
            Ok(CommitResponse::default())
        }
        async fn rollback(&self, _s: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close_session(&self, _s: &str, _st: Option<&str>) -> Result<(), BackendError> {
            Ok(())
        }
        async fn synthesize(&self, _s: &str, _t: &str) -> Result<Vec<u8>, BackendError> {
            Ok(vec![0; 1000])
        }
        async fn transcribe(&self, _w: &[u8]) -> Result<String, BackendError> {
            Ok(String::new())
        }
    }

    struct NullHandle;
    impl PlaybackHandle for NullHandle {
        fn stop(&mut self) {}
    }

    struct NullPlayback;
    impl MediaPlayback for NullPlayback {
        fn start(&self, _p: &FsPath) -> Result<Box<dyn PlaybackHandle>, PipelineError> {
            Ok(Box::new(NullHandle))
        }
    }

    struct FakeActions;
    impl CallActions for FakeActions {
        fn answer(&self, _c: u16) {}
        fn hangup_with_tag(&self, _t: &str) {}
        fn dial_dtmf(&self, _d: &str) {}
        fn refer(&self, _u: &str) {}
        fn is_confirmed(&self) -> bool {
            true
        }
        fn playback(&self) -> Arc<dyn MediaPlayback> {
            Arc::new(NullPlayback)
        }
    }

    struct FakeStack {
        ready: bool,
    }
    impl SipStack for FakeStack {
        fn make_call(
            &self,
            _to_uri: &str,
        ) -> Result<Arc<dyn CallActions>, voice_gateway_telephony::TelephonyError> {
            Ok(Arc::new(FakeActions))
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    struct SilentEstimator;
    impl SpeechEstimator for SilentEstimator {
        fn sampling_rate(&self) -> u32 {
            16_000
        }
        fn initialize_state(&self) -> Vec<f32> {
            Vec::new()
        }
        fn speech_probability(&self, _w: &[f32], _s: &mut Vec<f32>) -> f32 {
            0.0
        }
    }

    fn make_state(fail_create: bool, sip_ready: bool, token: Option<&str>) -> AppState {
        let settings = Settings {
            backend_url: "http://backend:8000".to_string(),
            ..Default::default()
        };
        AppState {
            gateway: Arc::new(Gateway::new(
                &settings,
                Arc::new(FakeBackend { fail_create }),
                Arc::new(FakeStack { ready: sip_ready }),
                Arc::new(SilentEstimator),
            )),
            authorization_token: token.map(str::to_string),
        }
    }

    fn call_request(body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/call")
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_is_open() {
        let app = create_router(make_state(false, true, Some("secret")));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_places_outbound_session() {
        let app = create_router(make_state(false, true, None));
        let response = app
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["message"], "ok");
        assert_eq!(body["session_id"], "sess-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_requires_to_uri() {
        let app = create_router(make_state(false, true, None));
        let response = app
            .oneshot(call_request(json!({}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_maps_backend_failure_to_500() {
        let app = create_router(make_state(true, true, None));
        let response = app
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await["message"],
            "failed to start session"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_maps_missing_sip_to_503() {
        let app = create_router(make_state(false, false, None));
        let response = app
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bearer_auth_is_enforced() {
        let app = create_router(make_state(false, true, Some("secret")));
        let response = app
            .clone()
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                Some("wrong"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(call_request(
                json!({"to_uri": "sip:bob@example.com"}),
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transfer_unknown_session_is_404() {
        let app = create_router(make_state(false, true, None));
        let response = app
            .oneshot(
                Request::post("/transfer/unknown")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"to_uri": "sip:op@example.com"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transfer_active_session_succeeds() {
        let state = make_state(false, true, None);
        let placed = state
            .gateway
            .place_call("sip:bob@example.com", json!({}), None)
            .await
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::post(format!("/transfer/{}", placed.session_id))
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"to_uri": "sip:op@example.com", "transfer_delay": 1.0}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["to_uri"], "sip:op@example.com");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_endpoint_renders_exposition() {
        let app = create_router(make_state(false, true, None));
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("client_requests_total"));
    }
}
