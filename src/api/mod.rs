//! Thin HTTP surface over the engine: message submission, SSE event
//! streaming, interrupts, and session administration. Everything here
//! delegates to the manager and scheduler; no orchestration logic lives in
//! handlers.

use crate::config::{ApiConfig, Config};
use crate::error::ErrorKind;
use crate::events::{EventBus, EventType, UnifiedEvent};
use crate::manager::{Manager, MessageOptions};
use crate::models::Priority;
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::{ChorusError, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SERVICE_NAME: &str = "chorus-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_SESSIONS: &str = "/sessions";
const ROUTE_SESSION_BY_ID: &str = "/sessions/{session_id}";
const ROUTE_SESSION_MESSAGES: &str = "/sessions/{session_id}/messages";
const ROUTE_SESSION_EVENTS: &str = "/sessions/{session_id}/events";
const ROUTE_SESSION_INTERRUPT: &str = "/sessions/{session_id}/interrupt";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    manager: Manager,
    scheduler: Scheduler,
    sessions: Arc<SessionStore>,
    bus: Arc<EventBus>,
    gateway: Arc<crate::llm::LlmGateway>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    pub text: String,
    pub conversation_id: Option<String>,
    pub stores: Option<Vec<String>>,
    pub top_k: Option<usize>,
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct SubmitMessageResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub created_at: String,
    pub turn_count: usize,
    pub event_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::CapacityExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Interrupted => StatusCode::CONFLICT,
        ErrorKind::LlmError | ErrorKind::StoreError | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn to_api_error(err: ChorusError) -> ApiError {
    let kind = err.kind();
    if kind == ErrorKind::Internal {
        warn!("Internal error surfaced to API: {}", err);
    }
    (
        status_for(kind),
        Json(ErrorResponse {
            error: err.client_message(),
            kind: kind.as_str(),
        }),
    )
}

impl ApiServer {
    pub fn new(config: &Config, system: &crate::system::System) -> Self {
        Self {
            config: config.api.clone(),
            manager: system.manager.clone(),
            scheduler: system.scheduler.clone(),
            sessions: system.sessions.clone(),
            bus: system.bus.clone(),
            gateway: system.gateway.clone(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ChorusError::Internal(e.into()))?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| ChorusError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_SESSIONS, post(create_session))
            .route(ROUTE_SESSION_BY_ID, get(get_session))
            .route(ROUTE_SESSION_BY_ID, delete(delete_session))
            .route(ROUTE_SESSION_MESSAGES, post(submit_message))
            .route(ROUTE_SESSION_EVENTS, get(stream_events))
            .route(ROUTE_SESSION_INTERRUPT, post(interrupt))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn create_session(
    State(api): State<ApiServer>,
    Json(request): Json<CreateSessionRequest>,
) -> std::result::Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session = api
        .sessions
        .create(request.session_id)
        .await
        .map_err(to_api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            created_at: session.created_at.to_rfc3339(),
        }),
    ))
}

async fn get_session(
    State(api): State<ApiServer>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<SessionResponse>, ApiError> {
    let session = api
        .sessions
        .snapshot(&session_id)
        .await
        .ok_or_else(|| to_api_error(ChorusError::NotFound(format!("session: {session_id}"))))?;
    Ok(Json(SessionResponse {
        session_id: session.id,
        created_at: session.created_at.to_rfc3339(),
        turn_count: session.turns.len(),
        event_count: session.events.len(),
    }))
}

async fn delete_session(
    State(api): State<ApiServer>,
    Path(session_id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    api.manager
        .delete_session(&session_id)
        .await
        .map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Submission endpoint: accepts a user message, returns the request task id
/// immediately. Progress arrives on the session's event stream.
async fn submit_message(
    State(api): State<ApiServer>,
    Path(session_id): Path<String>,
    Json(request): Json<SubmitMessageRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitMessageResponse>), ApiError> {
    if request.text.trim().is_empty() {
        return Err(to_api_error(ChorusError::BadInput(
            "message text cannot be empty".to_string(),
        )));
    }
    let priority = match request.priority {
        Some(value) => Some(Priority::new(value).ok_or_else(|| {
            to_api_error(ChorusError::BadInput(format!(
                "priority must be within [1..10], got {value}"
            )))
        })?),
        None => None,
    };

    let options = MessageOptions {
        conversation_id: request.conversation_id,
        stores: request.stores,
        top_k: request.top_k,
        priority,
    };
    let task_id = api
        .manager
        .submit_message(&session_id, &request.text, options)
        .await
        .map_err(to_api_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitMessageResponse {
            task_id,
            status: "accepted".to_string(),
        }),
    ))
}

async fn interrupt(
    State(api): State<ApiServer>,
    Path(session_id): Path<String>,
    Json(request): Json<InterruptRequest>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    match request.task_id {
        Some(task_id) => {
            api.manager
                .interrupt_task(&task_id)
                .await
                .map_err(to_api_error)?;
            Ok(Json(serde_json::json!({ "interrupted": [task_id] })))
        }
        None => {
            let interrupted = api.manager.interrupt_session(&session_id).await;
            Ok(Json(serde_json::json!({ "interrupted": interrupted })))
        }
    }
}

async fn system_status(State(api): State<ApiServer>) -> Json<serde_json::Value> {
    let snapshot = api.scheduler.snapshot().await;
    let usage = api.gateway.global_usage();
    Json(serde_json::json!({
        "scheduler": snapshot,
        "tokens": usage,
        "sessions": api.sessions.list_ids().await.len(),
    }))
}

/// Map a unified event onto the SSE frame contract:
/// `stream` → token frames, `result` → done, `error` → error, everything
/// else → metadata.
fn to_sse_frame(event: &UnifiedEvent) -> serde_json::Value {
    match event.event_type {
        EventType::Stream => serde_json::json!({
            "type": "token",
            "data": event.content.message,
        }),
        EventType::Result => serde_json::json!({
            "type": "done",
            "data": {
                "message_id": event.event_id,
                "answer": event.content.answer,
                "sources": event.content.sources,
                "metadata": event.metadata,
            },
        }),
        EventType::Error => serde_json::json!({
            "type": "error",
            "data": serde_json::to_value(event).unwrap_or_default(),
        }),
        _ => serde_json::json!({
            "type": "metadata",
            "data": serde_json::to_value(event).unwrap_or_default(),
        }),
    }
}

/// SSE stream of a session's live events.
///
/// A subscriber that falls behind its bounded buffer receives one terminal
/// error frame and is disconnected; other subscribers are unaffected.
async fn stream_events(
    State(api): State<ApiServer>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let receiver = api.bus.subscribe(&session_id).await;

    let stream = futures::stream::unfold(
        (receiver, session_id, false),
        |(mut receiver, session_id, done)| async move {
            if done {
                return None;
            }
            match receiver.recv().await {
                Ok(event) => {
                    let frame = to_sse_frame(&event);
                    Some((
                        Ok(SseEvent::default().data(frame.to_string())),
                        (receiver, session_id, false),
                    ))
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %session_id,
                        skipped,
                        "SSE subscriber lagged, disconnecting"
                    );
                    let frame = to_sse_frame(&EventBus::lagged_event(&session_id));
                    Some((
                        Ok(SseEvent::default().data(frame.to_string())),
                        (receiver, session_id, true),
                    ))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentRef, Stage};

    #[test]
    fn error_kinds_map_to_http_statuses() {
        assert_eq!(status_for(ErrorKind::BadInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::CapacityExhausted),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn sse_frames_follow_the_streaming_contract() {
        let stream_event = UnifiedEvent::new(
            "s",
            "t",
            EventType::Stream,
            Stage::Executing,
            AgentRef::system(),
        )
        .with_message("tok");
        let frame = to_sse_frame(&stream_event);
        assert_eq!(frame["type"], "token");
        assert_eq!(frame["data"], "tok");

        let result_event = UnifiedEvent::new(
            "s",
            "t",
            EventType::Result,
            Stage::Complete,
            AgentRef::system(),
        )
        .with_answer("final");
        let frame = to_sse_frame(&result_event);
        assert_eq!(frame["type"], "done");
        assert_eq!(frame["data"]["answer"], "final");
        assert!(frame["data"]["message_id"]
            .as_str()
            .unwrap()
            .starts_with("evt_"));

        let status_event = UnifiedEvent::new(
            "s",
            "t",
            EventType::Status,
            Stage::Classifying,
            AgentRef::system(),
        );
        assert_eq!(to_sse_frame(&status_event)["type"], "metadata");

        let error_event = UnifiedEvent::new(
            "s",
            "t",
            EventType::Error,
            Stage::Failed,
            AgentRef::system(),
        );
        assert_eq!(to_sse_frame(&error_event)["type"], "error");
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let (status, body) = to_api_error(ChorusError::Internal(anyhow::anyhow!("db password")));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0.error, "internal error");
        assert_eq!(body.0.kind, "internal");
    }
}
