use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::EngagementDatabase;
use crate::engagement::{
    AuditStore, ConfigStore, EngagementConfig, EngagementConfigPatch, EngagementCoordinator,
    EngagementEvent, Persona, PersonaChatRecord, PersonaRoster, RunOutcome,
};
use crate::runtime::BackendRuntime;
use crate::scheduler::validate_expression;

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<EngagementDatabase>,
    pub coordinator: Arc<EngagementCoordinator>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn required(token: &str) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListRecordsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    deleted: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<EngagementEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("CHIMEIN_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid CHIMEIN_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        db: runtime.database.clone(),
        coordinator: runtime.coordinator.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    let _scheduler = runtime.spawn_scheduler();

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Chimein backend listening on http://{}", bind_addr);
    axum::serve(listener, build_router(state))
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route(
            "/engagement/config",
            get(get_engagement_config).put(update_engagement_config),
        )
        .route("/engagement/run", post(run_engagement))
        .route("/engagement/records", get(list_records))
        .route("/personas", get(list_personas).put(upsert_persona))
        .route("/personas/:name", delete(delete_persona))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

pub fn spawn_event_bridge(
    event_rx: flume::Receiver<EngagementEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engagement_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engagement_event(event: EngagementEvent) -> ApiEventEnvelope {
    match event {
        EngagementEvent::RunStarted {
            run_id,
            channel_count,
        } => envelope(
            "run_started",
            serde_json::json!({ "run_id": run_id, "channel_count": channel_count }),
        ),
        EngagementEvent::ChannelSkipped { channel_id, reason } => envelope(
            "channel_skipped",
            serde_json::json!({ "channel_id": channel_id, "reason": reason }),
        ),
        EngagementEvent::ChannelFailed {
            channel_id,
            stage,
            error,
        } => envelope(
            "channel_failed",
            serde_json::json!({ "channel_id": channel_id, "stage": stage, "error": error }),
        ),
        EngagementEvent::Interjected {
            channel_id,
            persona_name,
            record_id,
        } => envelope(
            "interjected",
            serde_json::json!({
                "channel_id": channel_id,
                "persona_name": persona_name,
                "record_id": record_id
            }),
        ),
        EngagementEvent::RunFinished { run_id, outcome } => envelope(
            "run_finished",
            serde_json::json!({ "run_id": run_id, "outcome": outcome }),
        ),
        EngagementEvent::RunAborted { run_id, error } => envelope(
            "run_aborted",
            serde_json::json!({ "run_id": run_id, "error": error }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("CHIMEIN_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("CHIMEIN_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "CHIMEIN_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }

    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid CHIMEIN_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }

    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_engagement_config(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<EngagementConfig>, (StatusCode, String)> {
    state.db.get_config().map(Json).map_err(internal_error)
}

async fn update_engagement_config(
    State(state): State<Arc<ServerState>>,
    Json(patch): Json<EngagementConfigPatch>,
) -> Result<Json<EngagementConfig>, (StatusCode, String)> {
    if let Some(ref frequency) = patch.frequency {
        if !frequency.trim().is_empty() {
            validate_expression(frequency).map_err(|e| bad_request(format!("{:#}", e)))?;
        }
    }

    let config = state.db.update_config(&patch).map_err(internal_error)?;
    tracing::info!(
        "Engagement config updated: enabled={} channels={:?} frequency='{}' gap={}m",
        config.enabled,
        config.channel_ids,
        config.frequency,
        config.min_message_gap_mins
    );
    Ok(Json(config))
}

async fn run_engagement(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<RunOutcome>, (StatusCode, String)> {
    // Detached so a disconnecting client cannot cut a run short mid-delivery
    let coordinator = state.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.run_once().await });

    run.await
        .map_err(|e| internal_error(anyhow!("Engagement run task failed: {}", e)))?
        .map(Json)
        .map_err(internal_error)
}

async fn list_records(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListRecordsQuery>,
) -> Result<Json<Vec<PersonaChatRecord>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    state
        .db
        .list_recent_records(limit)
        .map(Json)
        .map_err(internal_error)
}

async fn list_personas(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Persona>>, (StatusCode, String)> {
    state.db.list_personas().map(Json).map_err(internal_error)
}

async fn upsert_persona(
    State(state): State<Arc<ServerState>>,
    Json(persona): Json<Persona>,
) -> Result<Json<Persona>, (StatusCode, String)> {
    if persona.name.trim().is_empty() {
        return Err(bad_request("name cannot be empty".to_string()));
    }
    if persona.prompt.trim().is_empty() {
        return Err(bad_request("prompt cannot be empty".to_string()));
    }

    state.db.upsert_persona(&persona).map_err(internal_error)?;
    tracing::info!("Persona '{}' saved", persona.name.trim());
    Ok(Json(persona))
}

async fn delete_persona(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<DeletedResponse>, (StatusCode, String)> {
    if state.db.delete_persona(&name).map_err(internal_error)? {
        Ok(Json(DeletedResponse { deleted: true }))
    } else {
        Err(not_found(format!("persona '{}' not found", name)))
    }
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "Websocket subscriber lagged, {} event(s) dropped",
                            skipped
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn bad_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
