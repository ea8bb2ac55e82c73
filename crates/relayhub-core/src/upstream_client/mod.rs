use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use relayhub_common::GlobalConfig;
use relayhub_protocol::sse::{SseEvent, SseParser, encode_data_frame};
use relayhub_provider_core::headers::end_to_end;
use relayhub_provider_core::{
    Channel, ChannelKind, CustomPayload, Headers, RawResponse, RelayError, StreamEnd,
    StreamFraming, StreamSender, UpstreamPayload, UpstreamProvider, UpstreamRequest, header_get, stream_channel,
};
use tracing::{debug, warn};
use wreq::{Client, Method, Proxy};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.proxy.clone(),
            connect_timeout: Duration::from_secs(global.connect_timeout_secs),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(global.stream_idle_timeout_secs),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Posts the canonical body to a channel's base URL over wreq.
///
/// Clients are cached per outbound proxy.
#[derive(Clone)]
pub struct HttpUpstreamProvider {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl std::fmt::Debug for HttpUpstreamProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstreamProvider")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpUpstreamProvider {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let client = build_client(&config, proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(proxy, client);
        Ok(Self {
            config,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    fn client(&self) -> Result<Client, RelayError> {
        let proxy = normalize_proxy(self.config.proxy.clone());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| RelayError::local(500, "upstream client cache lock failed"))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_wreq_error)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

#[async_trait]
impl UpstreamProvider for HttpUpstreamProvider {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamPayload, RelayError> {
        let client = self.client()?;
        let url = upstream_url(&request.channel, &request.path);
        let body = serde_json::to_vec(&request.body)
            .map_err(|err| RelayError::local(500, format!("serialize upstream body: {err}")))?;

        let mut builder = client.request(Method::POST, &url);
        for (name, value) in auth_headers(&request.channel) {
            builder = builder.header(name, value);
        }
        if request.stream {
            builder = builder.header("accept", "text/event-stream");
        }
        let resp = builder
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(map_wreq_error)?;

        convert_response(
            resp,
            request.stream,
            request.channel.kind,
            self.config.stream_idle_timeout,
        )
        .await
    }
}

/// Base URL plus the inbound path, without doubling the separator.
pub fn upstream_url(channel: &Channel, path: &str) -> String {
    format!(
        "{}/{}",
        channel.base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub fn auth_headers(channel: &Channel) -> Headers {
    let key = channel.api_key.clone();
    match channel.kind {
        ChannelKind::OpenAI | ChannelKind::Custom => {
            vec![("authorization".to_string(), format!("Bearer {key}"))]
        }
        ChannelKind::Anthropic => vec![
            ("x-api-key".to_string(), key),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ],
        ChannelKind::Gemini => vec![("x-goog-api-key".to_string(), key)],
        ChannelKind::Azure => vec![("api-key".to_string(), key)],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyClass {
    Json,
    EventStream,
    JsonLines,
    Binary,
    Other,
}

fn classify_content_type(content_type: Option<&str>) -> BodyClass {
    let Some(content_type) = content_type else {
        return BodyClass::Other;
    };
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("text/event-stream") {
        BodyClass::EventStream
    } else if content_type.contains("ndjson") || content_type.contains("jsonl") {
        BodyClass::JsonLines
    } else if content_type.contains("json") {
        BodyClass::Json
    } else if content_type.starts_with("audio/")
        || content_type.starts_with("image/")
        || content_type.starts_with("video/")
        || content_type.contains("octet-stream")
    {
        BodyClass::Binary
    } else {
        BodyClass::Other
    }
}

/// Framing the caller should see. OpenAI-style streams are re-wrapped as
/// `data:` frames and end with `[DONE]`; Claude and Gemini streams and JSON
/// lines keep the upstream's own framing.
fn stream_framing(kind: ChannelKind, class: BodyClass) -> StreamFraming {
    match (class, kind) {
        (BodyClass::JsonLines, _) | (_, ChannelKind::Anthropic | ChannelKind::Gemini) => {
            StreamFraming::Raw
        }
        _ => StreamFraming::Sse,
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    kind: ChannelKind,
    stream_idle_timeout: Duration,
) -> Result<UpstreamPayload, RelayError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    if !(200..300).contains(&status) {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Err(RelayError::from_upstream_body(status, &body));
    }

    let class = classify_content_type(header_get(&headers, "content-type"));
    match class {
        BodyClass::EventStream | BodyClass::JsonLines if want_stream => {
            let framing = stream_framing(kind, class);
            let content_type = header_get(&headers, "content-type").map(str::to_string);
            let (sender, handle) = stream_channel(STREAM_BUFFER);
            let decoder = FrameDecoder::new(class, framing);
            tokio::spawn(pump_upstream(resp, sender, decoder, stream_idle_timeout));
            Ok(UpstreamPayload::Stream(handle.with_framing(framing, content_type)))
        }
        _ => {
            let body = resp.bytes().await.map_err(map_wreq_error)?;
            classify_buffered(status, headers, body, class)
        }
    }
}

fn classify_buffered(
    status: u16,
    headers: Headers,
    body: Bytes,
    class: BodyClass,
) -> Result<UpstreamPayload, RelayError> {
    match class {
        BodyClass::Json => match serde_json::from_slice(&body) {
            Ok(value) => Ok(UpstreamPayload::Json(value)),
            Err(err) => {
                debug!(event = "upstream_json_invalid", error = %err);
                Ok(UpstreamPayload::Raw(RawResponse {
                    status,
                    headers: end_to_end(&headers),
                    body,
                }))
            }
        },
        BodyClass::Binary => Ok(UpstreamPayload::Custom(CustomPayload {
            headers: end_to_end(&headers),
            body,
        })),
        BodyClass::EventStream | BodyClass::JsonLines | BodyClass::Other => {
            Ok(UpstreamPayload::Raw(RawResponse {
                status,
                headers,
                body,
            }))
        }
    }
}

/// Producer task: decodes the upstream byte stream into frames until the
/// stream ends, goes idle, or the consumer leaves.
async fn pump_upstream(
    resp: wreq::Response,
    sender: StreamSender,
    mut decoder: FrameDecoder,
    stream_idle_timeout: Duration,
) {
    let mut stream = resp.bytes_stream();

    let end = loop {
        let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
        let item = match next {
            Ok(item) => item,
            Err(_) => {
                break StreamEnd::Error(RelayError::upstream(504, "upstream stream idle timeout"));
            }
        };
        let Some(item) = item else {
            if !send_all(&sender, decoder.finish()).await {
                return;
            }
            break StreamEnd::Done;
        };
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => break StreamEnd::Error(map_wreq_error(err)),
        };
        let (frames, done) = decoder.push(&chunk);
        if !send_all(&sender, frames).await {
            debug!(event = "upstream_stream_abandoned");
            return;
        }
        if done {
            break StreamEnd::Done;
        }
    };

    if let StreamEnd::Error(err) = &end {
        warn!(event = "upstream_stream_failed", status = err.status, message = %err.message);
    }
    sender.finish(end);
}

async fn send_all(sender: &StreamSender, frames: Vec<String>) -> bool {
    for frame in frames {
        if !sender.send(frame).await {
            return false;
        }
    }
    true
}

/// Splits upstream bytes into frames.
///
/// With SSE framing a frame is the `data` payload of one event; with raw
/// framing it is the whole event (or JSON line) re-encoded verbatim.
#[derive(Debug)]
struct FrameDecoder {
    sse: Option<SseParser>,
    framing: StreamFraming,
    pending: Vec<u8>,
}

impl FrameDecoder {
    fn new(class: BodyClass, framing: StreamFraming) -> Self {
        Self {
            sse: (class == BodyClass::EventStream).then(SseParser::new),
            framing,
            pending: Vec::new(),
        }
    }

    /// Frames completed by `chunk`, and whether the `[DONE]` sentinel arrived.
    fn push(&mut self, chunk: &Bytes) -> (Vec<String>, bool) {
        let framing = self.framing;
        match &mut self.sse {
            Some(parser) => collect_events(parser.push_bytes(chunk), framing),
            None => {
                self.pending.extend_from_slice(chunk);
                let mut frames = Vec::new();
                while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.pending.drain(..=pos).collect();
                    push_json_line(&mut frames, &line, framing);
                }
                (frames, false)
            }
        }
    }

    fn finish(&mut self) -> Vec<String> {
        let framing = self.framing;
        match &mut self.sse {
            Some(parser) => collect_events(parser.finish(), framing).0,
            None => {
                let line = std::mem::take(&mut self.pending);
                let mut frames = Vec::new();
                push_json_line(&mut frames, &line, framing);
                frames
            }
        }
    }
}

fn collect_events(events: Vec<SseEvent>, framing: StreamFraming) -> (Vec<String>, bool) {
    let mut frames = Vec::with_capacity(events.len());
    for event in events {
        let done = event.is_done();
        match framing {
            StreamFraming::Sse => {
                if done {
                    return (frames, true);
                }
                if !event.data.is_empty() {
                    frames.push(event.data);
                }
            }
            StreamFraming::Raw => {
                frames.push(encode_event(&event));
                if done {
                    return (frames, true);
                }
            }
        }
    }
    (frames, false)
}

/// One SSE event as it appeared upstream, minus comments.
fn encode_event(event: &SseEvent) -> String {
    let mut out = String::with_capacity(event.data.len() + 32);
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
        if event.data.is_empty() {
            out.push('\n');
            return out;
        }
    }
    out.push_str(&encode_data_frame(&event.data));
    out
}

fn push_json_line(frames: &mut Vec<String>, line: &[u8], framing: StreamFraming) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match framing {
        StreamFraming::Sse => frames.push(line.to_string()),
        StreamFraming::Raw => frames.push(format!("{line}\n")),
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

/// Transport failures never carry a provider status: they become 502, or
/// 504 when the transport timed out.
fn map_wreq_error(err: wreq::Error) -> RelayError {
    let status = if err.is_timeout() { 504 } else { 502 };
    let message = if err.is_connect() {
        format!("upstream connect failed: {err}")
    } else {
        format!("upstream transport error: {err}")
    };
    RelayError::upstream(status, message).with_type("upstream_error")
}
