use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use http::header::CONTENT_TYPE;
use relayhub_provider_core::{CaptureValue, ChannelId, RelayError, RoutingRequest};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::CoreState;
use crate::dispatch::dispatch;
use crate::engine::RelayCall;
use crate::log::RelayLog;

pub const GROUP_HEADER: &str = "x-relay-group";
pub const CHANNEL_HEADER: &str = "x-relay-channel";
pub const IGNORE_PIN_HEADER: &str = "x-relay-channel-ignore-pin";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// What the handler needs from a canonical request body.
#[derive(Debug, Clone, PartialEq)]
struct CanonicalRequest {
    body: Value,
    model: String,
    stream: bool,
}

pub async fn relay_handler(State(state): State<Arc<CoreState>>, req: Request) -> Response {
    let started_at = Instant::now();
    let (parts, body) = req.into_parts();
    let headers = parts.headers;
    let path = parts.uri.path().to_string();
    let request_id = request_id(&headers).unwrap_or_else(|| Uuid::now_v7().simple().to_string());
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            let err = RelayError::local(413, format!("read request body: {err}"));
            return error_response(&err, &request_id);
        }
    };
    let canonical = match parse_canonical(&body) {
        Ok(canonical) => canonical,
        Err(err) => return error_response(&err, &request_id),
    };
    let mut routing = match routing_request(&headers, &state.default_group, &canonical.model) {
        Ok(routing) => routing,
        Err(err) => return error_response(&err, &request_id),
    };

    info!(
        event = "downstream_received",
        request_id = %request_id,
        path = %path,
        model = %canonical.model,
        group = %routing.group,
        pinned = ?routing.pinned,
        is_stream = canonical.stream
    );

    let scope = state.capture.open_scope();
    scope.put(CaptureValue::RequestBody(
        String::from_utf8_lossy(&body).into_owned(),
    ));
    if let Some(ip) = client_ip(&headers).or(peer) {
        scope.put(CaptureValue::ClientIp(ip));
    }

    let call = RelayCall {
        trace_id: request_id.clone(),
        path: path.clone(),
        body: canonical.body,
        stream: canonical.stream,
    };
    let outcome = match state.engine.relay(&call, &mut routing).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                event = "downstream_responded",
                request_id = %request_id,
                status = err.status,
                error = %err.message,
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = canonical.stream
            );
            return error_response(&err, &request_id);
        }
    };

    let is_stream = matches!(
        outcome.payload,
        relayhub_provider_core::UpstreamPayload::Stream(_)
    );
    let log = RelayLog {
        sink: state.log_sink.clone(),
        request_id: request_id.clone(),
        channel_id: outcome.channel.id,
        model: routing.model.clone(),
        started_at,
    };
    let mut response = match dispatch(outcome.payload, scope, log).await {
        Ok(response) => response,
        Err(err) => return error_response(&err, &request_id),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        event = "downstream_responded",
        request_id = %request_id,
        channel_id = outcome.channel.id,
        attempts = outcome.attempts,
        status = response.status().as_u16(),
        elapsed_ms = started_at.elapsed().as_millis(),
        is_stream
    );
    response
}

fn parse_canonical(body: &[u8]) -> Result<CanonicalRequest, RelayError> {
    let body: Value = serde_json::from_slice(body)
        .map_err(|err| RelayError::local(400, format!("invalid request body: {err}")))?;
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| RelayError::local(400, "request body has no model"))?
        .to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    Ok(CanonicalRequest {
        body,
        model,
        stream,
    })
}

fn routing_request(
    headers: &HeaderMap,
    default_group: &str,
    model: &str,
) -> Result<RoutingRequest, RelayError> {
    let group = header_str(headers, GROUP_HEADER).unwrap_or(default_group);
    let routing = RoutingRequest::new(model, group);
    let Some(raw) = header_str(headers, CHANNEL_HEADER) else {
        return Ok(routing);
    };
    let channel_id: ChannelId = raw.parse().map_err(|_| {
        RelayError::local(400, format!("invalid {CHANNEL_HEADER} header: {raw}"))
            .with_code("invalid_pinned_channel")
    })?;
    let ignore_pin = header_str(headers, IGNORE_PIN_HEADER)
        .is_some_and(|value| value.eq_ignore_ascii_case("true") || value == "1");
    Ok(routing.pinned_to(channel_id, ignore_pin))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, REQUEST_ID_HEADER)
        .or_else(|| header_str(headers, "request-id"))
        .map(|value| value.to_string())
}

/// First hop of `x-forwarded-for`, then `x-real-ip`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }
    header_str(headers, "x-real-ip").map(|value| value.to_string())
}

fn error_response(err: &RelayError, request_id: &str) -> Response {
    let rendered = err.render_for_caller(request_id);
    let mut resp = Response::new(Body::from(rendered.body.to_string()));
    *resp.status_mut() =
        StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}
