use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{ChannelId, ChannelStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionActor {
    /// The relay engine, after classifying an upstream failure.
    System,
    Admin(String),
}

/// Audit record of one channel status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatusTransition {
    pub channel_id: ChannelId,
    pub from: ChannelStatus,
    pub to: ChannelStatus,
    pub reason: String,
    pub actor: TransitionActor,
    pub at: SystemTime,
}

impl ChannelStatusTransition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}
