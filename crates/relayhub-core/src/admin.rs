use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use relayhub_provider_core::{Channel, ChannelId, ChannelStatus, RegistryError, TransitionActor};
use serde::Deserialize;
use serde_json::json;

use crate::core::CoreState;

const DEFAULT_OPERATOR: &str = "admin";

pub fn admin_router(state: Arc<CoreState>) -> Router {
    Router::new()
        .route("/admin/channels", get(list_channels))
        .route("/admin/channels/{id}/status", post(set_channel_status))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_admin_key(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if key != state.admin_key {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_admin_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = auth[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

async fn list_channels(State(state): State<Arc<CoreState>>) -> impl IntoResponse {
    let registry = state.engine.router().registry();
    let channels = registry.channels();
    let channels: Vec<&Channel> = channels.iter().map(|channel| channel.as_ref()).collect();
    Json(json!({
        "channels": channels,
        "transitions": registry.transitions(),
    }))
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: ChannelStatus,
    #[serde(default)]
    reason: Option<String>,
    /// Recorded as the acting admin.
    #[serde(default)]
    operator: Option<String>,
}

async fn set_channel_status(
    State(state): State<Arc<CoreState>>,
    Path(id): Path<ChannelId>,
    Json(change): Json<StatusChange>,
) -> Response {
    let operator = change
        .operator
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OPERATOR.to_string());
    let reason = change
        .reason
        .unwrap_or_else(|| format!("set by {operator}"));

    let registry = state.engine.router().registry();
    match registry
        .set_status(id, change.status, reason, TransitionActor::Admin(operator))
        .await
    {
        Ok(transition) => (StatusCode::OK, Json(json!({ "transition": transition }))).into_response(),
        Err(err @ RegistryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}
