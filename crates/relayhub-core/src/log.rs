use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use relayhub_provider_core::{CaptureScope, CapturedResponse, ChannelId};
use relayhub_transform::UnifiedResponse;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

const REQUEST_BODY_HEADING: &str = "\n【Request Body】:\n";
const RESPONSE_BODY_HEADING: &str = "\n【Response Body】:\n";

/// One finished relay, as handed to the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayLogEntry {
    pub content: String,
    pub client_ip: Option<String>,
    pub request_id: String,
    pub channel_id: ChannelId,
    pub model: String,
    pub status: u16,
    pub elapsed_ms: u64,
    /// The caller saw a truncated or failed stream.
    pub no_cache: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, entry: RelayLogEntry);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl TracingLogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LogSink for TracingLogSink {
    async fn record(&self, entry: RelayLogEntry) {
        info!(
            event = "relay_logged",
            request_id = %entry.request_id,
            channel_id = entry.channel_id,
            model = %entry.model,
            status = entry.status,
            elapsed_ms = entry.elapsed_ms,
            no_cache = entry.no_cache,
            finished_at = %entry.finished_at,
            client_ip = ?entry.client_ip,
            content = %entry.content,
        );
    }
}

/// Canonical `{type, content}` object for whatever the caller received.
pub fn unify_response(response: &CapturedResponse) -> UnifiedResponse {
    match response {
        CapturedResponse::Json(text) => UnifiedResponse::from_json_body(text),
        CapturedResponse::Stream { transcript, .. } => UnifiedResponse::from_transcript(transcript),
        CapturedResponse::Custom { body, .. } => UnifiedResponse::from_custom(body),
        CapturedResponse::Raw {
            status,
            headers,
            body,
        } => UnifiedResponse::from_raw(*status, headers, body),
    }
}

pub fn build_log_content(request_body: &str, response: Option<&CapturedResponse>) -> String {
    let mut content = String::with_capacity(request_body.len() + 256);
    content.push_str(REQUEST_BODY_HEADING);
    content.push_str(request_body);
    content.push_str(RESPONSE_BODY_HEADING);
    if let Some(response) = response {
        content.push_str(&unify_response(response).to_pretty_string());
    }
    content
}

/// Everything needed to turn a drained capture scope into a log entry.
#[derive(Clone)]
pub struct RelayLog {
    pub sink: Arc<dyn LogSink>,
    pub request_id: String,
    pub channel_id: ChannelId,
    pub model: String,
    pub started_at: Instant,
}

impl std::fmt::Debug for RelayLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLog")
            .field("request_id", &self.request_id)
            .field("channel_id", &self.channel_id)
            .field("model", &self.model)
            .finish()
    }
}

impl RelayLog {
    /// Drains the scope and hands the entry to the sink. The scope is
    /// released afterwards.
    pub async fn complete(self, scope: CaptureScope, status: u16) {
        let request_body = scope.take_request_body().unwrap_or_default();
        let client_ip = scope.take_client_ip();
        let response = scope.take_response();
        drop(scope);

        let entry = RelayLogEntry {
            content: build_log_content(&request_body, response.as_ref()),
            client_ip,
            request_id: self.request_id,
            channel_id: self.channel_id,
            model: self.model,
            status,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            no_cache: response.as_ref().is_some_and(CapturedResponse::no_cache),
            finished_at: OffsetDateTime::now_utc(),
        };
        self.sink.record(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn content_carries_both_sections() {
        let response = CapturedResponse::Stream {
            transcript: concat!(
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
                "data: [DONE]\n\n",
            )
            .to_string(),
            no_cache: false,
        };
        let content = build_log_content("{\"model\":\"m\"}", Some(&response));
        assert!(content.starts_with("\n【Request Body】:\n{\"model\":\"m\"}\n【Response Body】:\n"));
        assert!(content.contains("\"type\": \"stream\""));
        assert!(content.contains("\"content\": \"hi\""));
    }

    #[test]
    fn missing_response_leaves_section_empty() {
        let content = build_log_content("{}", None);
        assert!(content.ends_with("【Response Body】:\n"));
    }

    #[test]
    fn binary_custom_body_is_encoded() {
        let unified = unify_response(&CapturedResponse::Custom {
            content_type: Some("audio/mpeg".to_string()),
            body: Bytes::from_static(&[0xff, 0x00, 0x10]),
        });
        assert_eq!(unified.content, serde_json::json!("/wAQ"));
    }
}
