use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::types::Event;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn write(&self, event: &Event);
}

/// Fan-out point for relay events: broadcast subscribers plus sinks.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.inner.tx.receiver_count())
            .finish()
    }
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    /// Sinks run on their own tasks; a slow sink never stalls the caller.
    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}
