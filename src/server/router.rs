//! HTTP router and handlers.
//!
//! Administrative surfaces return full reason codes; the data path
//! (`/api/proxy-request`) returns only the pipeline's opaque bodies.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::agent::AgentDirectory;
use crate::config::RoleConfig;
use crate::metrics::GatewayMetrics;
use crate::proxy::{ProxyPipeline, ProxyRequest};
use crate::secrets::SecretsStore;
use crate::telemetry::TelemetryLog;
use crate::token::{Scope, TokenService};
use crate::{Error, adapter};

/// Shared application state.
pub struct AppState {
    /// Roles agents can be created with
    pub roles: HashMap<String, RoleConfig>,
    /// Agent directory
    pub agents: Arc<AgentDirectory>,
    /// Token service
    pub tokens: Arc<TokenService>,
    /// Secrets store
    pub secrets: Arc<SecretsStore>,
    /// Proxy pipeline
    pub pipeline: Arc<ProxyPipeline>,
    /// Metrics registry
    pub metrics: Arc<GatewayMetrics>,
    /// Telemetry log
    pub telemetry: Arc<TelemetryLog>,
}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/create-agent", post(create_agent))
        .route("/api/generate-token", post(generate_token))
        .route("/api/proxy-request", post(proxy_request))
        .route("/api/admin/creds/set", post(creds_set))
        .route("/api/admin/creds/activate", post(creds_activate))
        .route("/api/admin/creds/{tool}/versions", get(creds_versions))
        .route("/api/admin/tokens", get(list_tokens))
        .route("/api/admin/tokens/{id}/revoke", post(revoke_token))
        .route("/api/admin/agents/{id}/disable", post(disable_agent))
        .route("/api/admin/telemetry", get(query_telemetry))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map an error to an administrative response (full reason codes).
fn admin_error(e: &Error) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct CreateAgentBody {
    name: String,
    role: String,
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAgentBody>,
) -> Response {
    let Some(role) = state.roles.get(&body.role) else {
        return admin_error(&Error::Validation(format!("unknown role {:?}", body.role)));
    };
    let allowed_tools = role.allowed_tools.clone();
    let agents = Arc::clone(&state.agents);
    let name = body.name.clone();
    let role_name = body.role.clone();

    // RSA keygen is CPU-heavy; keep it off the async workers.
    let created = tokio::task::spawn_blocking(move || agents.create(&name, &role_name, allowed_tools))
        .await
        .map_err(|e| Error::Internal(format!("keygen task: {e}")))
        .and_then(|r| r);

    match created {
        Ok((agent, private_key)) => {
            state.telemetry.record(
                crate::telemetry::TelemetryEvent::agent_created(
                    &Uuid::new_v4().to_string(),
                    &agent.role,
                )
                .with_agent(&agent.id.to_string()),
            );
            info!(agent_id = %agent.id, role = %agent.role, "Created agent");
            // The private key crosses the wire exactly once, here.
            (
                StatusCode::OK,
                Json(json!({
                    "agent_id": agent.id,
                    "public_key": agent.public_key_pem,
                    "private_key": &*private_key,
                })),
            )
                .into_response()
        }
        Err(e) => admin_error(&e),
    }
}

#[derive(Deserialize)]
struct GenerateTokenBody {
    agent_id: Uuid,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    actions: Option<Vec<String>>,
    #[serde(default)]
    permissions: Vec<String>,
    expires_at: DateTime<Utc>,
}

async fn generate_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateTokenBody>,
) -> Response {
    let ttl = body.expires_at - Utc::now();
    let Ok(ttl) = ttl.to_std() else {
        return admin_error(&Error::Validation("expires_at must be in the future".into()));
    };

    // When the caller names no actions, grant the built-in actions of the
    // requested tools.
    let actions = body.actions.unwrap_or_else(|| {
        adapter::BUILTIN_ROUTES
            .iter()
            .filter(|(tool, _)| body.tools.iter().any(|t| t == tool))
            .map(|(_, action)| (*action).to_string())
            .collect()
    });
    let scope = Scope::new(body.tools, actions, body.permissions);

    match state
        .tokens
        .mint(body.agent_id, scope, ttl, &Uuid::new_v4().to_string())
    {
        Ok(minted) => (
            StatusCode::OK,
            Json(json!({
                "agent_token": minted.token,
                "token_id": minted.token_id,
                "expires_at": minted.expires_at,
            })),
        )
            .into_response(),
        Err(e) => admin_error(&e),
    }
}

async fn proxy_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProxyRequest>,
) -> Response {
    let response = state.pipeline.handle(body, None).await;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::HeaderName::from_static("x-correlation-id"),
                response.correlation_id.as_str(),
            ),
        ],
        response.body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct CredsSetBody {
    tool: String,
    version: u64,
    credential: String,
    #[serde(default)]
    metadata: Value,
}

async fn creds_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredsSetBody>,
) -> Response {
    match state.secrets.put(
        &body.tool,
        body.version,
        body.credential.as_bytes(),
        body.metadata,
        &Uuid::new_v4().to_string(),
    ) {
        Ok(id) => (StatusCode::OK, Json(json!({ "id": id }))).into_response(),
        Err(e) => admin_error(&e),
    }
}

#[derive(Deserialize)]
struct CredsActivateBody {
    id: Uuid,
}

async fn creds_activate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredsActivateBody>,
) -> Response {
    match state.secrets.activate(body.id, &Uuid::new_v4().to_string()) {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => admin_error(&e),
    }
}

async fn creds_versions(
    State(state): State<Arc<AppState>>,
    Path(tool): Path<String>,
) -> Response {
    let versions = state.secrets.list_versions(&tool);
    (StatusCode::OK, Json(json!({ "tool": tool, "versions": versions }))).into_response()
}

#[derive(Deserialize)]
struct TokenListQuery {
    agent_id: Option<Uuid>,
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenListQuery>,
) -> Response {
    let rows = state.tokens.list(query.agent_id);
    (StatusCode::OK, Json(json!({ "tokens": rows }))).into_response()
}

async fn revoke_token(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.tokens.revoke(id, &Uuid::new_v4().to_string()) {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => admin_error(&e),
    }
}

async fn disable_agent(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.agents.disable(id) {
        Ok(agent) => {
            let revoked = state.tokens.revoke_for_agent(agent.id);
            state.telemetry.record(
                crate::telemetry::TelemetryEvent::agent_disabled(
                    &Uuid::new_v4().to_string(),
                    revoked,
                )
                .with_agent(&agent.id.to_string()),
            );
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "revoked_tokens": revoked })),
            )
                .into_response()
        }
        Err(e) => admin_error(&e),
    }
}

#[derive(Deserialize)]
struct TelemetryQuery {
    correlation_id: Option<String>,
    agent_id: Option<String>,
    #[serde(default = "default_telemetry_limit")]
    limit: usize,
}

fn default_telemetry_limit() -> usize {
    100
}

async fn query_telemetry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryQuery>,
) -> Response {
    let events = if let Some(ref correlation_id) = query.correlation_id {
        state.telemetry.by_correlation(correlation_id)
    } else if let Some(ref agent_id) = query.agent_id {
        state.telemetry.by_agent(agent_id)
    } else {
        state.telemetry.recent(query.limit)
    };
    (
        StatusCode::OK,
        Json(json!({ "events": events, "dropped": state.telemetry.dropped() })),
    )
        .into_response()
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    // Construction already required a valid KEK; readiness additionally
    // verifies the stores answer.
    let kek_version = state.secrets.kek_version();
    (
        StatusCode::OK,
        Json(json!({ "ready": true, "kek_version": kek_version })),
    )
        .into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
