use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relayhub_common::SelectionMode;
use tracing::{error, warn};

use crate::channel::{Channel, ChannelId, ChannelKind, ChannelRegistry};
use crate::errors::RouteError;

/// Per-request routing inputs, plus what the router decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingRequest {
    pub model: String,
    pub group: String,
    pub pinned: Option<ChannelId>,
    pub ignore_pin: bool,
    /// Grows by one channel per failed attempt.
    pub excluded: Vec<ChannelId>,
    pub chosen: Option<(ChannelId, ChannelKind)>,
}

impl RoutingRequest {
    pub fn new(model: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn pinned_to(mut self, channel_id: ChannelId, ignore_pin: bool) -> Self {
        self.pinned = Some(channel_id);
        self.ignore_pin = ignore_pin;
        self
    }

    pub fn exclude(&mut self, channel_id: ChannelId) {
        if !self.excluded.contains(&channel_id) {
            self.excluded.push(channel_id);
        }
    }

    /// A pin that selection must honour.
    pub fn is_hard_pinned(&self) -> bool {
        self.pinned.is_some() && !self.ignore_pin
    }
}

/// How one channel is chosen among the eligible set.
pub enum SelectionPolicy {
    WeightedRandom(Mutex<StdRng>),
    RoundRobin(Mutex<HashMap<(String, String), usize>>),
}

impl std::fmt::Debug for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionPolicy::WeightedRandom(_) => f.write_str("WeightedRandom"),
            SelectionPolicy::RoundRobin(_) => f.write_str("RoundRobin"),
        }
    }
}

impl SelectionPolicy {
    pub fn weighted_random(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        SelectionPolicy::WeightedRandom(Mutex::new(rng))
    }

    pub fn round_robin() -> Self {
        SelectionPolicy::RoundRobin(Mutex::new(HashMap::new()))
    }

    pub fn from_mode(mode: SelectionMode, seed: Option<u64>) -> Self {
        match mode {
            SelectionMode::WeightedRandom => Self::weighted_random(seed),
            SelectionMode::RoundRobin => Self::round_robin(),
        }
    }

    /// `candidates` is sorted by ascending id and never empty.
    fn pick(&self, request: &RoutingRequest, candidates: &[Arc<Channel>]) -> usize {
        match self {
            SelectionPolicy::WeightedRandom(rng) => {
                let weights: Vec<u32> = candidates.iter().map(|channel| channel.weight).collect();
                let mut rng = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                pick_weighted_index(&mut *rng, &weights)
            }
            SelectionPolicy::RoundRobin(counters) => {
                let mut counters = counters
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let counter = counters
                    .entry((request.group.clone(), request.model.clone()))
                    .or_insert(0);
                let index = *counter % candidates.len();
                *counter = counter.wrapping_add(1);
                index
            }
        }
    }
}

fn pick_weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[u32]) -> usize {
    if weights.is_empty() {
        return 0;
    }

    let total: u64 = weights.iter().map(|weight| *weight as u64).sum();
    if total == 0 {
        return rng.random_range(0..weights.len());
    }

    let mut roll = rng.random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = *weight as u64;
        if roll < weight {
            return index;
        }
        roll -= weight;
    }

    weights.len() - 1
}

pub struct ChannelRouter {
    registry: Arc<dyn ChannelRegistry>,
    policy: SelectionPolicy,
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("policy", &self.policy)
            .finish()
    }
}

impl ChannelRouter {
    pub fn new(registry: Arc<dyn ChannelRegistry>, policy: SelectionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<dyn ChannelRegistry> {
        &self.registry
    }

    /// Picks one channel for `request` and records it as the chosen channel.
    ///
    /// Every call reads the current registry snapshot, so a status change
    /// made between two calls is always observed.
    pub fn select_channel(&self, request: &mut RoutingRequest) -> Result<Arc<Channel>, RouteError> {
        let channel = match request.pinned {
            Some(channel_id) if !request.ignore_pin => self.select_pinned(request, channel_id)?,
            _ => self.select_from_group(request)?,
        };
        request.chosen = Some((channel.id, channel.kind));
        Ok(channel)
    }

    fn select_pinned(
        &self,
        request: &RoutingRequest,
        channel_id: ChannelId,
    ) -> Result<Arc<Channel>, RouteError> {
        let channel = self
            .registry
            .channel(channel_id)
            .ok_or(RouteError::InvalidPinnedChannel(channel_id))?;
        if !channel.status.is_enabled() {
            return Err(RouteError::PinnedChannelDisabled(channel_id));
        }
        if !channel.supports_model(&request.model) {
            return Err(RouteError::PinnedChannelUnsupportedModel {
                channel_id,
                model: request.model.clone(),
            });
        }
        Ok(channel)
    }

    fn select_from_group(&self, request: &RoutingRequest) -> Result<Arc<Channel>, RouteError> {
        let ids = self.registry.candidates(&request.group, &request.model);
        if ids.is_empty() {
            return Err(RouteError::NoAvailableChannel {
                group: request.group.clone(),
                model: request.model.clone(),
            });
        }

        let mut dangling = None;
        let mut candidates = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.registry.channel(*id) {
                Some(channel) if channel.is_eligible(&request.group, &request.model) => {
                    if !request.excluded.contains(id) {
                        candidates.push(channel);
                    }
                }
                Some(_) => {}
                None => dangling = Some(*id),
            }
        }

        if candidates.is_empty() {
            match dangling {
                Some(channel_id) => error!(
                    event = "channel_index_dangling",
                    channel_id,
                    group = %request.group,
                    model = %request.model,
                    "channel index references a channel that does not exist"
                ),
                None => warn!(
                    event = "channel_candidates_exhausted",
                    group = %request.group,
                    model = %request.model,
                    indexed = ids.len(),
                    excluded = request.excluded.len(),
                ),
            }
            return Err(RouteError::Inconsistent {
                channel_id: dangling.or_else(|| ids.first().copied()),
            });
        }

        candidates.sort_by_key(|channel| channel.id);
        let index = self.policy.pick(request, &candidates);
        Ok(candidates.swap_remove(index))
    }
}
