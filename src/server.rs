use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::SessionEngine;
use crate::error::ChatError;
use crate::persona::Preset;
use crate::settings::SettingsPatch;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub metrics: Option<PrometheusHandle>,
}

/// Caller identity from the trusted `x-user-id` header.
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or_else(|| {
                let body = json!({ "error": "missing x-user-id header", "kind": "unauthorized" });
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            })
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            ChatError::Provider { .. } => StatusCode::BAD_GATEWAY,
            ChatError::Configuration(_) | ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message, "kind": self.kind() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ChatError>;

#[derive(Debug, Deserialize)]
struct StartSessionBody {
    persona_id: String,
    #[serde(default)]
    model_key: String,
    #[serde(default)]
    title: String,
}

async fn start_session(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(body): Json<StartSessionBody>,
) -> ApiResult<impl IntoResponse> {
    let session = state.engine.start_session(&user, &body.persona_id, &body.model_key, &body.title).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// The most recent sessions plus the caller's total session count.
async fn list_sessions(State(state): State<AppState>, Caller(user): Caller) -> ApiResult<impl IntoResponse> {
    let sessions = state.engine.list_sessions(&user).await?;
    let total = state.engine.count_sessions(&user).await?;
    Ok(Json(json!({ "sessions": sessions, "total": total })))
}

async fn session_overview(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.session_overview(&user, id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsBody {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    model_key: String,
    #[serde(flatten)]
    patch: SettingsPatch,
}

async fn update_settings(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSettingsBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_settings(&user, id, &body.mode, &body.model_key, &body.patch).await?))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn set_status(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.set_session_status(&user, id, &body.status).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.delete_session(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_session(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.engine.clear_session(&user, id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn last_reply(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let reply = state.engine.last_reply(&user, id).await?;
    Ok(Json(json!({ "reply": reply })))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    content: String,
    #[serde(default)]
    preset: Option<Preset>,
    #[serde(default)]
    stream: bool,
}

async fn send_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<SendBody>,
) -> ApiResult<Response> {
    if body.stream {
        return Ok(stream_reply(state.engine, user, id, body).into_response());
    }
    let messages = state.engine.send_message(&user, id, &body.content, body.preset.as_ref()).await?;
    Ok(Json(messages).into_response())
}

/// Runs the send on its own task and relays deltas as SSE events. If the
/// client goes away during generation the task is aborted and nothing is
/// stored; a reply already being committed is still stored and billed.
fn stream_reply(
    engine: Arc<SessionEngine>,
    user: String,
    session_id: Uuid,
    body: SendBody,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    let chunks = tx.clone();
    let mut task = tokio::spawn(async move {
        let mut forward = |content: &str, reasoning: &str| {
            if content.is_empty() && reasoning.is_empty() {
                return;
            }
            let _ = chunks.send(json_event("delta", &json!({ "content": content, "reasoning": reasoning })));
        };
        engine
            .send_message_stream(&user, session_id, &body.content, body.preset.as_ref(), &mut forward)
            .await
    });

    tokio::spawn(async move {
        tokio::select! {
            joined = &mut task => {
                let event = match joined {
                    Ok(Ok(messages)) => json_event("done", &messages),
                    Ok(Err(e)) => json_event("error", &json!({ "error": e.to_string(), "kind": e.kind() })),
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "streaming send task failed");
                        json_event("error", &json!({ "error": "internal error", "kind": "internal" }))
                    }
                };
                let _ = tx.send(event);
            }
            _ = tx.closed() => {
                task.abort();
                info!(session_id = %session_id, "client disconnected, send cancelled");
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn json_event(name: &str, payload: &impl serde::Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().event("error").data("unencodable payload"))
}

#[derive(Debug, Deserialize)]
struct EditBody {
    content: String,
}

async fn update_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<EditBody>,
) -> ApiResult<StatusCode> {
    state.engine.update_message(&user, id, &body.content).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.delete_message(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.retry_assistant_message(&user, id).await?))
}

async fn list_models(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_models().await?))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(start_session).get(list_sessions))
        .route("/v1/sessions/:id", get(session_overview).delete(delete_session))
        .route("/v1/sessions/:id/settings", patch(update_settings))
        .route("/v1/sessions/:id/status", patch(set_status))
        .route("/v1/sessions/:id/messages", post(send_message).delete(clear_session))
        .route("/v1/sessions/:id/last-reply", get(last_reply))
        .route("/v1/messages/:id", patch(update_message).delete(delete_message))
        .route("/v1/messages/:id/retry", post(retry_message))
        .route("/v1/models", get(list_models))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
