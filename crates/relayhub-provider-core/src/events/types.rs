use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, ChannelKind, ChannelStatusTransition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Upstream(AttemptFailedEvent),
    Operational(OperationalEvent),
}

/// One failed upstream attempt and what the classifier made of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub attempt_no: u32,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub channel_kind: ChannelKind,
    pub model: String,
    pub status: u16,
    pub message: String,
    pub local: bool,
    pub will_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    ChannelStatusChanged(ChannelStatusTransition),
    CaptureLeaked(CaptureLeakedEvent),
}

/// A capture slot the sweeper had to evict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureLeakedEvent {
    pub at: SystemTime,
    pub token: String,
    pub age_ms: u64,
    pub fields: Vec<String>,
}
