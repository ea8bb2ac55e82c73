//! Hand-off buffer between request handling and log assembly.
//!
//! Every in-flight request owns one `CaptureToken`, minted by
//! `CaptureStore::open_scope`. The scope guard clears whatever is left for
//! its token when it drops; a sweeper evicts unowned slots that outlive a
//! TTL.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{CaptureLeakedEvent, Event, EventHub, OperationalEvent};
use crate::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureToken(Uuid);

impl CaptureToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for CaptureToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    RequestBody,
    ClientIp,
    FullResponse,
}

/// What the caller actually received.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedResponse {
    Json(String),
    Stream { transcript: String, no_cache: bool },
    Custom { content_type: Option<String>, body: Bytes },
    Raw { status: u16, headers: Headers, body: Bytes },
}

impl CapturedResponse {
    pub fn no_cache(&self) -> bool {
        matches!(self, CapturedResponse::Stream { no_cache: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureValue {
    RequestBody(String),
    ClientIp(String),
    FullResponse(CapturedResponse),
}

impl CaptureValue {
    pub fn kind(&self) -> CaptureKind {
        match self {
            CaptureValue::RequestBody(_) => CaptureKind::RequestBody,
            CaptureValue::ClientIp(_) => CaptureKind::ClientIp,
            CaptureValue::FullResponse(_) => CaptureKind::FullResponse,
        }
    }
}

#[derive(Debug)]
struct CaptureSlot {
    opened_at: Instant,
    /// A live `CaptureScope` holds this slot; the sweeper leaves it alone.
    owned: bool,
    request_body: Option<String>,
    client_ip: Option<String>,
    response: Option<CapturedResponse>,
}

impl CaptureSlot {
    fn new() -> Self {
        Self {
            opened_at: Instant::now(),
            owned: false,
            request_body: None,
            client_ip: None,
            response: None,
        }
    }

    fn held(&self) -> Vec<CaptureKind> {
        let mut kinds = Vec::new();
        if self.request_body.is_some() {
            kinds.push(CaptureKind::RequestBody);
        }
        if self.client_ip.is_some() {
            kinds.push(CaptureKind::ClientIp);
        }
        if self.response.is_some() {
            kinds.push(CaptureKind::FullResponse);
        }
        kinds
    }
}

/// Token-keyed capture map. The lock guards the map only; stored values are
/// never mutated except the stream transcript, which grows under the lock.
#[derive(Default)]
pub struct CaptureStore {
    slots: Mutex<HashMap<CaptureToken, CaptureSlot>>,
    events: Option<EventHub>,
}

impl fmt::Debug for CaptureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureStore")
            .field("slots", &self.len())
            .finish()
    }
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evictions are also emitted on `events`.
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CaptureToken, CaptureSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_scope(self: &Arc<Self>) -> CaptureScope {
        let token = CaptureToken::new();
        self.slots().insert(
            token,
            CaptureSlot {
                owned: true,
                ..CaptureSlot::new()
            },
        );
        CaptureScope {
            store: Arc::clone(self),
            token,
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns false when the field already holds a value; the first value
    /// stays.
    pub fn store(&self, token: CaptureToken, value: CaptureValue) -> bool {
        let mut slots = self.slots();
        let slot = slots.entry(token).or_insert_with(CaptureSlot::new);
        match value {
            CaptureValue::RequestBody(body) => fill(&mut slot.request_body, body),
            CaptureValue::ClientIp(ip) => fill(&mut slot.client_ip, ip),
            CaptureValue::FullResponse(response) => fill(&mut slot.response, response),
        }
    }

    /// Appends to the token's stream transcript, starting one if needed.
    /// Tokens that are no longer open are ignored.
    pub fn append_stream(&self, token: CaptureToken, text: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&token) else {
            return false;
        };
        match slot.response.get_or_insert_with(|| CapturedResponse::Stream {
            transcript: String::new(),
            no_cache: false,
        }) {
            CapturedResponse::Stream { transcript, .. } => {
                transcript.push_str(text);
                true
            }
            _ => false,
        }
    }

    pub fn mark_no_cache(&self, token: CaptureToken) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(&token).and_then(|slot| slot.response.as_mut()) {
            Some(CapturedResponse::Stream { no_cache, .. }) => {
                *no_cache = true;
                true
            }
            _ => false,
        }
    }

    /// Removes and returns one field. A second take of the same field, or a
    /// take on an unknown token, returns `None`.
    pub fn take_and_clear(&self, token: CaptureToken, kind: CaptureKind) -> Option<CaptureValue> {
        let mut slots = self.slots();
        let slot = slots.get_mut(&token)?;
        match kind {
            CaptureKind::RequestBody => slot.request_body.take().map(CaptureValue::RequestBody),
            CaptureKind::ClientIp => slot.client_ip.take().map(CaptureValue::ClientIp),
            CaptureKind::FullResponse => slot.response.take().map(CaptureValue::FullResponse),
        }
    }

    /// Drops the slot, returning the kinds that were still held.
    pub fn clear(&self, token: CaptureToken) -> Vec<CaptureKind> {
        self.slots()
            .remove(&token)
            .map(|slot| slot.held())
            .unwrap_or_default()
    }

    /// Removes slots older than `ttl` that no scope owns.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<(CaptureToken, Duration, Vec<CaptureKind>)> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.slots().retain(|token, slot| {
            let age = now.saturating_duration_since(slot.opened_at);
            if slot.owned || age < ttl {
                return true;
            }
            evicted.push((*token, age, slot.held()));
            false
        });
        evicted
    }

    /// Periodically evicts unowned slots older than `ttl`. The task ends once
    /// the store itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                for (token, age, fields) in store.sweep_expired(ttl) {
                    let fields: Vec<String> = fields.iter().map(|kind| format!("{kind:?}")).collect();
                    warn!(
                        event = "capture_leaked",
                        token = %token,
                        age_ms = age.as_millis() as u64,
                        fields = ?fields,
                        "capture slot outlived its ttl and was evicted"
                    );
                    if let Some(events) = &store.events {
                        events
                            .emit(Event::Operational(OperationalEvent::CaptureLeaked(
                                CaptureLeakedEvent {
                                    at: SystemTime::now(),
                                    token: token.to_string(),
                                    age_ms: age.as_millis() as u64,
                                    fields,
                                },
                            )))
                            .await;
                    }
                }
            }
        })
    }
}

fn fill<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Ownership of one request's capture slot. Dropping it releases the slot.
pub struct CaptureScope {
    store: Arc<CaptureStore>,
    token: CaptureToken,
}

impl fmt::Debug for CaptureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureScope")
            .field("token", &self.token)
            .finish()
    }
}

impl CaptureScope {
    pub fn token(&self) -> CaptureToken {
        self.token
    }

    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    pub fn put(&self, value: CaptureValue) -> bool {
        self.store.store(self.token, value)
    }

    pub fn take(&self, kind: CaptureKind) -> Option<CaptureValue> {
        self.store.take_and_clear(self.token, kind)
    }

    pub fn take_request_body(&self) -> Option<String> {
        match self.take(CaptureKind::RequestBody) {
            Some(CaptureValue::RequestBody(body)) => Some(body),
            _ => None,
        }
    }

    pub fn take_client_ip(&self) -> Option<String> {
        match self.take(CaptureKind::ClientIp) {
            Some(CaptureValue::ClientIp(ip)) => Some(ip),
            _ => None,
        }
    }

    pub fn take_response(&self) -> Option<CapturedResponse> {
        match self.take(CaptureKind::FullResponse) {
            Some(CaptureValue::FullResponse(response)) => Some(response),
            _ => None,
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        let left = self.store.clear(self.token);
        if !left.is_empty() {
            debug!(
                event = "capture_scope_released",
                token = %self.token,
                fields = ?left,
            );
        }
    }
}
