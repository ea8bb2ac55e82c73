use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Channel, ChannelId, ChannelStatus, ChannelStatusTransition, TransitionActor};
use crate::events::{Event, EventHub, OperationalEvent};

/// Transitions kept in memory per registry.
const AUDIT_TRAIL_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel #{0} not found")]
    NotFound(ChannelId),
    #[error("duplicate channel id #{0}")]
    DuplicateId(ChannelId),
}

/// Read side of the channel table, as consumed by the router and admin routes.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    /// Ids of enabled channels in `group` that declare `model`.
    fn candidates(&self, group: &str, model: &str) -> Vec<ChannelId>;

    fn channel(&self, id: ChannelId) -> Option<Arc<Channel>>;

    fn channels(&self) -> Vec<Arc<Channel>>;

    fn transitions(&self) -> Vec<ChannelStatusTransition>;

    /// Moves a channel to `status`. The change is visible to the next read.
    async fn set_status(
        &self,
        id: ChannelId,
        status: ChannelStatus,
        reason: String,
        actor: TransitionActor,
    ) -> Result<ChannelStatusTransition, RegistryError>;
}

type IndexKey = (String, String);

/// Immutable view of the channel table. Writers publish a new snapshot.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub channels: Arc<BTreeMap<ChannelId, Arc<Channel>>>,
    pub index: Arc<HashMap<IndexKey, Vec<ChannelId>>>,
    pub transitions: Arc<VecDeque<ChannelStatusTransition>>,
}

impl RegistrySnapshot {
    pub fn build(channels: Vec<Channel>) -> Result<Self, RegistryError> {
        let mut table = BTreeMap::new();
        for channel in channels {
            let id = channel.id;
            if table.insert(id, Arc::new(channel)).is_some() {
                return Err(RegistryError::DuplicateId(id));
            }
        }
        let index = build_index(&table);
        Ok(Self {
            channels: Arc::new(table),
            index: Arc::new(index),
            transitions: Arc::new(VecDeque::new()),
        })
    }

    /// Uses a caller-supplied index instead of deriving it from the table.
    pub fn with_index(
        channels: Vec<Channel>,
        index: HashMap<IndexKey, Vec<ChannelId>>,
    ) -> Result<Self, RegistryError> {
        let mut snapshot = Self::build(channels)?;
        snapshot.index = Arc::new(index);
        Ok(snapshot)
    }
}

fn build_index(channels: &BTreeMap<ChannelId, Arc<Channel>>) -> HashMap<IndexKey, Vec<ChannelId>> {
    let mut index: HashMap<IndexKey, Vec<ChannelId>> = HashMap::new();
    for channel in channels.values() {
        if !channel.status.is_enabled() {
            continue;
        }
        for group in &channel.groups {
            for model in channel.models.keys() {
                index
                    .entry((group.clone(), model.clone()))
                    .or_default()
                    .push(channel.id);
            }
        }
    }
    index
}

/// Channel table held in memory and swapped copy-on-write.
pub struct MemoryChannelRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    events: Option<EventHub>,
}

impl std::fmt::Debug for MemoryChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("MemoryChannelRegistry")
            .field("channel_count", &snapshot.channels.len())
            .field("transition_count", &snapshot.transitions.len())
            .finish()
    }
}

impl MemoryChannelRegistry {
    pub fn new(channels: Vec<Channel>) -> Result<Self, RegistryError> {
        Ok(Self::from_snapshot(RegistrySnapshot::build(channels)?))
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::new(Arc::new(snapshot)),
            events: None,
        }
    }

    /// Status transitions are also emitted on `events`.
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }
}

#[async_trait]
impl ChannelRegistry for MemoryChannelRegistry {
    fn candidates(&self, group: &str, model: &str) -> Vec<ChannelId> {
        self.snapshot
            .load()
            .index
            .get(&(group.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.snapshot.load().channels.get(&id).cloned()
    }

    fn channels(&self) -> Vec<Arc<Channel>> {
        self.snapshot.load().channels.values().cloned().collect()
    }

    fn transitions(&self) -> Vec<ChannelStatusTransition> {
        self.snapshot.load().transitions.iter().cloned().collect()
    }

    async fn set_status(
        &self,
        id: ChannelId,
        status: ChannelStatus,
        reason: String,
        actor: TransitionActor,
    ) -> Result<ChannelStatusTransition, RegistryError> {
        if !self.snapshot.load().channels.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        let at = SystemTime::now();

        let previous = self.snapshot.rcu(|current| {
            let Some(channel) = current.channels.get(&id) else {
                return Arc::clone(current);
            };
            if channel.status == status {
                return Arc::clone(current);
            }

            let mut updated = Channel::clone(channel);
            updated.status = status;
            let mut channels = BTreeMap::clone(&current.channels);
            channels.insert(id, Arc::new(updated));

            let mut transitions = VecDeque::clone(&current.transitions);
            if transitions.len() >= AUDIT_TRAIL_LEN {
                transitions.pop_front();
            }
            transitions.push_back(ChannelStatusTransition {
                channel_id: id,
                from: channel.status,
                to: status,
                reason: reason.clone(),
                actor: actor.clone(),
                at,
            });

            let index = build_index(&channels);
            Arc::new(RegistrySnapshot {
                channels: Arc::new(channels),
                index: Arc::new(index),
                transitions: Arc::new(transitions),
            })
        });

        let from = previous
            .channels
            .get(&id)
            .map(|channel| channel.status)
            .ok_or(RegistryError::NotFound(id))?;
        let transition = ChannelStatusTransition {
            channel_id: id,
            from,
            to: status,
            reason,
            actor,
            at,
        };
        if transition.is_noop() {
            return Ok(transition);
        }

        if status.is_enabled() {
            info!(
                event = "channel_status_changed",
                channel_id = id,
                from = ?transition.from,
                to = ?transition.to,
                actor = ?transition.actor,
                reason = %transition.reason,
            );
        } else {
            warn!(
                event = "channel_status_changed",
                channel_id = id,
                from = ?transition.from,
                to = ?transition.to,
                actor = ?transition.actor,
                reason = %transition.reason,
            );
        }
        if let Some(events) = &self.events {
            events
                .emit(Event::Operational(OperationalEvent::ChannelStatusChanged(
                    transition.clone(),
                )))
                .await;
        }
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::channel::ChannelKind;

    fn channel(id: ChannelId) -> Channel {
        Channel {
            id,
            name: format!("c{id}"),
            kind: ChannelKind::OpenAI,
            status: ChannelStatus::Enabled,
            groups: BTreeSet::from(["default".to_string()]),
            models: BTreeMap::from([("gpt-4o".to_string(), String::new())]),
            weight: 1,
            base_url: String::new(),
            api_key: String::new(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = MemoryChannelRegistry::new(vec![channel(1), channel(1)]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(1)));
    }

    #[tokio::test]
    async fn transitions_rebuild_the_index_and_audit_trail() {
        let registry = MemoryChannelRegistry::new(vec![channel(1), channel(2)]).unwrap();
        assert_eq!(registry.candidates("default", "gpt-4o"), vec![1, 2]);

        let transition = registry
            .set_status(
                1,
                ChannelStatus::ManuallyDisabled,
                "maintenance".to_string(),
                TransitionActor::Admin("ops".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(transition.from, ChannelStatus::Enabled);
        assert_eq!(registry.candidates("default", "gpt-4o"), vec![2]);
        assert_eq!(
            registry.channel(1).unwrap().status,
            ChannelStatus::ManuallyDisabled
        );

        let repeat = registry
            .set_status(
                1,
                ChannelStatus::ManuallyDisabled,
                "again".to_string(),
                TransitionActor::System,
            )
            .await
            .unwrap();
        assert!(repeat.is_noop());
        assert_eq!(registry.transitions().len(), 1);
        assert_eq!(registry.transitions()[0].reason, "maintenance");
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let registry = MemoryChannelRegistry::new(vec![channel(1)]).unwrap();
        let err = registry
            .set_status(9, ChannelStatus::Enabled, String::new(), TransitionActor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(9)));
    }
}
