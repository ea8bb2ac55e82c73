#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relayhub_core::{LogSink, RelayLogEntry};
use relayhub_provider_core::{
    Channel, ChannelId, ChannelKind, ChannelStatus, RelayError, StreamEnd, StreamFraming,
    UpstreamPayload, UpstreamProvider, UpstreamRequest, stream_channel,
};
use serde_json::Value;
use tokio::sync::oneshot;

pub fn channel(id: ChannelId, kind: ChannelKind, weight: u32) -> Channel {
    Channel {
        id,
        name: format!("ch{id}"),
        kind,
        status: ChannelStatus::Enabled,
        groups: BTreeSet::from(["default".to_string()]),
        models: BTreeMap::from([("gpt-4o".to_string(), String::new())]),
        weight,
        base_url: "http://upstream.invalid".to_string(),
        api_key: format!("sk-{id}"),
    }
}

/// One scripted upstream answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Fail(RelayError),
    Json(Value),
    Stream(Vec<String>, StreamEnd),
    /// Completed stream with explicit framing and an optional finalizer trailer.
    Framed {
        frames: Vec<String>,
        framing: StreamFraming,
        content_type: Option<String>,
        trailer: Option<String>,
    },
    /// Repeats one frame until the consumer is gone, then reports the
    /// result of the failed send.
    Endless(String, SendReport),
}

pub type SendReport = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

pub fn send_report() -> (SendReport, oneshot::Receiver<bool>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Answers per channel, in order. A channel without a script fails with 500.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<HashMap<ChannelId, VecDeque<Reply>>>,
    calls: Mutex<Vec<(ChannelId, String, Value)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, channel_id: ChannelId, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push_back(reply);
        self
    }

    /// Channel ids in call order.
    pub fn called(&self) -> Vec<ChannelId> {
        self.calls.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    /// Trace ids the engine attached to each call.
    pub fn trace_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, trace_id, _)| trace_id.clone())
            .collect()
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamPayload, RelayError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.channel.id, request.trace_id.clone(), request.body.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.channel.id)
            .and_then(VecDeque::pop_front);
        match reply {
            None => Err(RelayError::upstream(500, "unscripted channel")),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Json(value)) => Ok(UpstreamPayload::Json(value)),
            Some(Reply::Stream(frames, end)) => {
                let (sender, handle) = stream_channel(4);
                tokio::spawn(async move {
                    for frame in frames {
                        if !sender.send(frame).await {
                            return;
                        }
                    }
                    sender.finish(end);
                });
                Ok(UpstreamPayload::Stream(handle))
            }
            Some(Reply::Framed {
                frames,
                framing,
                content_type,
                trailer,
            }) => {
                let (sender, handle) = stream_channel(4);
                let mut handle = handle.with_framing(framing, content_type);
                if let Some(trailer) = trailer {
                    handle = handle.with_finalizer(Box::new(move || Some(trailer)));
                }
                tokio::spawn(async move {
                    for frame in frames {
                        if !sender.send(frame).await {
                            return;
                        }
                    }
                    sender.finish(StreamEnd::Done);
                });
                Ok(UpstreamPayload::Stream(handle))
            }
            Some(Reply::Endless(frame, report)) => {
                let (sender, handle) = stream_channel(1);
                tokio::spawn(async move {
                    loop {
                        let sent = sender.send(frame.clone()).await;
                        if !sent {
                            if let Some(tx) = report.lock().unwrap().take() {
                                let _ = tx.send(sent);
                            }
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                Ok(UpstreamPayload::Stream(handle))
            }
        }
    }
}

/// Keeps every entry it receives.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<RelayLogEntry>>,
    notify: tokio::sync::Notify,
}

impl MemoryLogSink {
    pub fn entries(&self) -> Vec<RelayLogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Waits until at least `count` entries arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<RelayLogEntry> {
        loop {
            let notified = self.notify.notified();
            let entries = self.entries();
            if entries.len() >= count {
                return entries;
            }
            tokio::time::timeout(std::time::Duration::from_secs(5), notified)
                .await
                .expect("log entry within 5s");
        }
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn record(&self, entry: RelayLogEntry) {
        self.entries.lock().unwrap().push(entry);
        self.notify.notify_waiters();
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
