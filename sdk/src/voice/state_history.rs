use dashmap::DashMap;
use std::collections::VecDeque;
use voicegate_protocol::{UserId, VoiceState};

use crate::config::DEFAULT_STATE_HISTORY_LEN;

/// Object cache for passive voice presence.
pub trait VoiceStateStore: Send + Sync {
    /// Record the latest state for its user. Returns the state it supersedes.
    fn record(&self, state: VoiceState) -> Option<VoiceState>;

    /// Known states for a user, oldest first.
    fn history(&self, user_id: UserId) -> Vec<VoiceState>;

    fn latest(&self, user_id: UserId) -> Option<VoiceState>;

    fn forget(&self, user_id: UserId);
}

/// Bounded per-user history; the oldest state is evicted first.
pub struct VoiceStateHistory {
    states: DashMap<UserId, VecDeque<VoiceState>>,
    capacity: usize,
}

impl VoiceStateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for VoiceStateHistory {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_HISTORY_LEN)
    }
}

impl VoiceStateStore for VoiceStateHistory {
    fn record(&self, state: VoiceState) -> Option<VoiceState> {
        let mut entry = self.states.entry(state.user_id).or_default();
        let before = entry.back().cloned();

        entry.push_back(state);
        while entry.len() > self.capacity {
            entry.pop_front();
        }

        before
    }

    fn history(&self, user_id: UserId) -> Vec<VoiceState> {
        self.states
            .get(&user_id)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn latest(&self, user_id: UserId) -> Option<VoiceState> {
        self.states
            .get(&user_id)
            .and_then(|entry| entry.back().cloned())
    }

    fn forget(&self, user_id: UserId) {
        self.states.remove(&user_id);
    }
}
