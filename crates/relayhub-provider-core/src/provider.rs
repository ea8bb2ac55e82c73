use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::channel::Channel;
use crate::errors::RelayError;
use crate::headers::Headers;

/// Trailer text produced once a stream ends cleanly (for example a synthetic
/// usage frame).
pub type StreamFinalizer = Box<dyn FnOnce() -> Option<String> + Send>;

/// Terminal signal of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    Error(RelayError),
}

/// How stream frames are written to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFraming {
    /// Each frame becomes `data: {frame}\n\n`, followed by `data: [DONE]`.
    #[default]
    Sse,
    /// Frames are already framed by the upstream and pass through verbatim.
    Raw,
}

/// Consumer half of a stream: frames on `data`, then one signal on `end`.
pub struct StreamHandle {
    pub data: mpsc::Receiver<String>,
    pub end: oneshot::Receiver<StreamEnd>,
    pub finalizer: Option<StreamFinalizer>,
    pub framing: StreamFraming,
    /// Overrides `text/event-stream` for raw framing.
    pub content_type: Option<String>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("framing", &self.framing)
            .field("content_type", &self.content_type)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

impl StreamHandle {
    pub fn with_finalizer(mut self, finalizer: StreamFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn with_framing(mut self, framing: StreamFraming, content_type: Option<String>) -> Self {
        self.framing = framing;
        self.content_type = content_type;
        self
    }
}

/// Producer half of a stream.
#[derive(Debug)]
pub struct StreamSender {
    data: mpsc::Sender<String>,
    end: oneshot::Sender<StreamEnd>,
}

impl StreamSender {
    /// Returns false once the consumer is gone; the producer should stop.
    pub async fn send(&self, frame: String) -> bool {
        self.data.send(frame).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.data.is_closed()
    }

    /// Closes the data channel, then delivers the terminal signal.
    pub fn finish(self, end: StreamEnd) {
        let StreamSender { data, end: end_tx } = self;
        drop(data);
        let _ = end_tx.send(end);
    }
}

/// Creates a linked producer/consumer pair with `buffer` frames of slack.
pub fn stream_channel(buffer: usize) -> (StreamSender, StreamHandle) {
    let (data_tx, data_rx) = mpsc::channel(buffer.max(1));
    let (end_tx, end_rx) = oneshot::channel();
    (
        StreamSender {
            data: data_tx,
            end: end_tx,
        },
        StreamHandle {
            data: data_rx,
            end: end_rx,
            finalizer: None,
            framing: StreamFraming::Sse,
            content_type: None,
        },
    )
}

/// A pre-rendered body with provider-dictated headers (audio, images).
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPayload {
    pub headers: Headers,
    pub body: Bytes,
}

/// An upstream HTTP response copied through as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum UpstreamPayload {
    Json(Value),
    Stream(StreamHandle),
    Custom(CustomPayload),
    Raw(RawResponse),
}

/// One attempt against one channel.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub trace_id: String,
    pub channel: Arc<Channel>,
    /// Inbound path, e.g. `/v1/chat/completions`.
    pub path: String,
    /// Canonical body with `model` already mapped for this channel.
    pub body: Value,
    pub stream: bool,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamPayload, RelayError>;
}
