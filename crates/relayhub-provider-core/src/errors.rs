use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::channel::ChannelId;

/// Error types minted by the gateway itself rather than copied from a provider.
const GATEWAY_ERROR_TYPES: &[&str] = &[
    "relay_error",
    "one_api_error",
    "new_api_error",
    "shell_api_error",
];

pub const SATURATED_MESSAGE: &str = "upstream load is saturated, please retry later";

static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\(request id: [^)]*\)").expect("valid request id pattern")
});

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota|balance|credit|余额|额度|令牌|无可用渠道|no available channel")
        .expect("valid quota pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Never left the gateway (serialisation, write failures, bad input).
    Local,
    /// Status and message came from a provider.
    Upstream,
    /// The channel table contradicts itself.
    Consistency,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RelayError {
    pub status: u16,
    pub message: String,
    pub error_type: String,
    pub code: Option<String>,
    pub kind: ErrorKind,
}

impl RelayError {
    pub fn local(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_type: "relay_error".to_string(),
            code: None,
            kind: ErrorKind::Local,
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_type: "upstream_error".to_string(),
            code: None,
            kind: ErrorKind::Upstream,
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
            error_type: "relay_error".to_string(),
            code: Some("channel_inconsistent".to_string()),
            kind: ErrorKind::Consistency,
        }
    }

    /// Builds an upstream error from a provider error body, reading the usual
    /// `{"error": {"message", "type", "code"}}` envelope when present.
    pub fn from_upstream_body(status: u16, body: &[u8]) -> Self {
        let fallback = || {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                format!("upstream returned status {status}")
            } else {
                text
            }
        };
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::upstream(status, fallback());
        };

        let envelope = value.get("error").unwrap_or(&value);
        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| envelope.as_str())
            .map(str::to_string)
            .unwrap_or_else(fallback);
        let mut error = Self::upstream(status, message);
        if let Some(error_type) = envelope.get("type").and_then(Value::as_str) {
            error.error_type = error_type.to_string();
        }
        error.code = match envelope.get("code") {
            Some(Value::String(code)) => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        };
        error
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Errors that never reached a provider are not attributed to a channel.
    pub fn is_local(&self) -> bool {
        !matches!(self.kind, ErrorKind::Upstream)
    }

    pub fn render_for_caller(&self, request_id: &str) -> RenderedError {
        let mut status = self.status;
        let mut error_type = self.error_type.clone();
        let mut code = self.code.clone();
        let mut message = REQUEST_ID_RE.replace_all(&self.message, "").into_owned();

        let gateway_type = GATEWAY_ERROR_TYPES.contains(&error_type.as_str());
        if gateway_type {
            error_type = "system_error".to_string();
        }
        // Provider quota errors carry account details; they are masked too.
        if (gateway_type || self.kind == ErrorKind::Upstream) && QUOTA_RE.is_match(&message) {
            message = SATURATED_MESSAGE.to_string();
            error_type = "system_error".to_string();
            code = None;
            status = 429;
        }
        let message = format!("{message} (request id: {request_id})");

        RenderedError {
            status,
            body: json!({
                "error": {
                    "message": message,
                    "type": error_type,
                    "param": Value::Null,
                    "code": code,
                }
            }),
        }
    }
}

/// Caller-facing form of a `RelayError`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedError {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no available channel for model {model} under group {group}")]
    NoAvailableChannel { group: String, model: String },
    #[error("data consistency broken, contact the administrator")]
    Inconsistent { channel_id: Option<ChannelId> },
    #[error("pinned channel #{0} does not exist")]
    InvalidPinnedChannel(ChannelId),
    #[error("pinned channel #{0} is disabled")]
    PinnedChannelDisabled(ChannelId),
    #[error("pinned channel #{channel_id} does not serve model {model}")]
    PinnedChannelUnsupportedModel { channel_id: ChannelId, model: String },
}

impl From<RouteError> for RelayError {
    fn from(value: RouteError) -> Self {
        let message = value.to_string();
        match value {
            RouteError::NoAvailableChannel { .. } => {
                RelayError::local(503, message).with_code("no_available_channel")
            }
            RouteError::Inconsistent { .. } => RelayError::consistency(message),
            RouteError::InvalidPinnedChannel(_) => {
                RelayError::local(400, message).with_code("invalid_pinned_channel")
            }
            RouteError::PinnedChannelDisabled(_) => {
                RelayError::local(403, message).with_code("pinned_channel_disabled")
            }
            RouteError::PinnedChannelUnsupportedModel { .. } => {
                RelayError::local(400, message).with_code("pinned_channel_unsupported_model")
            }
        }
    }
}
