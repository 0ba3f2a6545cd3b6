//! Hub configuration and per-intent propagation policy.

use shared::{Intent, IntentKind};
use std::collections::BTreeMap;
use std::time::Duration;

/// How quickly an accepted update reaches the other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    Immediate,
    /// Coalesce updates to the same target and publish at most once per window.
    Debounced(Duration),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How long a dropped participant may take to come back before removal.
    pub resume_window: Duration,
    /// A session with nobody connected for this long is evicted.
    pub idle_timeout: Duration,
    /// A connection silent for this long is considered dropped.
    pub connection_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub housekeeping_interval: Duration,
    /// Log entries included in a join snapshot.
    pub recent_log_len: usize,
    pub max_participants: usize,
    /// Fixed RNG seed for dice; entropy when unset.
    pub dice_seed: Option<u64>,
    pub propagation: BTreeMap<IntentKind, PropagationPolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut propagation = BTreeMap::new();
        propagation.insert(
            IntentKind::UpdateCharacter,
            PropagationPolicy::Debounced(Duration::from_millis(300)),
        );
        propagation.insert(
            IntentKind::UpdateNote,
            PropagationPolicy::Debounced(Duration::from_millis(300)),
        );

        Self {
            bind_addr: "127.0.0.1:7878".to_string(),
            resume_window: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            connection_idle_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            housekeeping_interval: Duration::from_millis(250),
            recent_log_len: 50,
            max_participants: 16,
            dice_seed: None,
            propagation,
        }
    }
}

impl ServerConfig {
    /// Policy for a specific intent.
    ///
    /// Only full-replacement updates (characters, notes, sketch) can be
    /// coalesced; everything else is immediate whatever the table says.
    /// A character update flagged `instant_refresh` is always immediate.
    pub fn policy_for(&self, intent: &Intent) -> PropagationPolicy {
        match intent {
            Intent::UpdateCharacter {
                instant_refresh: true,
                ..
            } => PropagationPolicy::Immediate,
            Intent::UpdateCharacter { .. } | Intent::UpdateNote { .. } | Intent::UpdateSketch(_) => {
                self.propagation
                    .get(&intent.kind())
                    .copied()
                    .unwrap_or(PropagationPolicy::Immediate)
            }
            _ => PropagationPolicy::Immediate,
        }
    }

    /// Disables all debouncing.
    pub fn immediate(mut self) -> Self {
        self.propagation.clear();
        self
    }
}
