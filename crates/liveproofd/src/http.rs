//! Bootstrap HTTP endpoints and the WebSocket upgrade.
//!
//! - POST /session      create a session, returns its one-time token
//! - GET  /session/:id  public session view
//! - GET  /health       liveness, live session count and detector availability
//! - GET  /config       capabilities, loaded models and the active policy
//! - GET  /ws           verification WebSocket

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use liveproof_core::ChallengeKind;
use liveproof_models::ModelMetadata;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::config::Policy;
use crate::session::{actor, SessionDeps};
use crate::store::{NewSession, SessionInfo};

/// What the daemon knows about its detector model.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub tag: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ModelMetadata>,
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionDeps,
    pub models: Arc<Vec<ModelInfo>>,
    pub max_message_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/:id", get(get_session))
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        };
        let body = ErrorBody {
            error: message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<NewSession>) {
    let session = state.sessions.store.create().await;
    (StatusCode::CREATED, Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    state
        .sessions
        .store
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
    detector: DetectorHealth,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectorHealth {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    workers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.sessions.engine;
    Json(HealthResponse {
        status: if engine.detector_available() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.store.len().await,
        detector: DetectorHealth {
            available: engine.detector_available(),
            model: engine.model_tag().map(str::to_string),
            workers: engine.workers(),
        },
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    capabilities: Capabilities,
    models: Vec<ModelInfo>,
    policy: Policy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Capabilities {
    challenges: Vec<ChallengeKind>,
    challenges_per_attempt: usize,
    challenge_timeout_ms: u64,
    binary_frames: bool,
    server_detection: bool,
    max_fps: u32,
    max_message_bytes: usize,
}

async fn config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let policy = state.sessions.policy.as_ref().clone();
    Json(ConfigResponse {
        capabilities: Capabilities {
            challenges: policy.enabled_challenges.clone(),
            challenges_per_attempt: policy.challenges_per_attempt,
            challenge_timeout_ms: policy.challenge_timeout_ms,
            binary_frames: true,
            server_detection: state.sessions.engine.detector_available(),
            max_fps: state.sessions.max_fps,
            max_message_bytes: state.max_message_bytes,
        },
        models: state.models.as_ref().clone(),
        policy,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| actor::run(socket, state.sessions))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use liveproof_core::buffer::DEFAULT_MAX_TOTAL_BYTES;
    use liveproof_core::{ByteBudget, DetectorError, FaceDetect};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::{spawn_pool, PoolConfig};
    use crate::rate_limiter::HandshakeLimiter;
    use crate::store::SessionStore;

    fn test_state() -> AppState {
        let factory = |_: usize| -> Result<Option<Box<dyn FaceDetect>>, DetectorError> { Ok(None) };
        let engine = spawn_pool(
            PoolConfig {
                workers: 1,
                queue_depth: 1,
                timeout: Duration::from_secs(1),
                grid_size: 8,
            },
            &factory,
        )
        .unwrap();
        let policy = Policy::default();
        AppState {
            sessions: SessionDeps {
                store: SessionStore::new(
                    Duration::from_secs(60),
                    HandshakeLimiter::default(),
                    policy.enabled_challenges.clone(),
                ),
                policy: Arc::new(policy),
                engine,
                budget: ByteBudget::new(DEFAULT_MAX_TOTAL_BYTES),
                buffer_max_frames: 50,
                max_fps: 15,
            },
            models: Arc::new(vec![ModelInfo {
                tag: "scrfd@det_10g".into(),
                path: "models/det_10g.onnx".into(),
                metadata: None,
            }]),
            max_message_bytes: 1 << 20,
        }
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get_session() {
        let app = router(test_state());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["sessionId"].as_str().unwrap().to_string();
        assert_eq!(created["token"].as_str().unwrap().len(), 64);
        assert_eq!(created["challenges"].as_array().unwrap().len(), 6);

        let resp = app.oneshot(get(&format!("/session/{id}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["sessionId"], id.as_str());
        assert_eq!(view["state"], "active");
        assert!(view.get("token").is_none());
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let resp = router(test_state())
            .oneshot(get("/session/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], 404);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_detector() {
        let resp = router(test_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["detector"]["available"], false);
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_config_exposes_policy() {
        let resp = router(test_state()).oneshot(get("/config")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["capabilities"]["maxFps"], 15);
        assert_eq!(body["capabilities"]["binaryFrames"], true);
        assert_eq!(body["models"][0]["tag"], "scrfd@det_10g");
        assert_eq!(body["policy"]["challenges_per_attempt"], 3);
        assert_eq!(body["policy"]["pad"]["reject_severity"], 0.5);
    }
}
