//! Transition tracking and the cooldown gate
//!
//! Each rule remembers its last overall match state so the engine only
//! fires on edges. The first observation after load/edit records state
//! without firing, which avoids spurious firings on startup. The tracker
//! also owns the rest of a rule's runtime state: the `running` flag that
//! serializes sequence executions and the `last_fired_at` timestamp the
//! cooldown gate checks against.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A rule's overall match state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    /// Not yet observed since load/edit
    #[default]
    Unknown,
    Matched,
    Unmatched,
}

/// Runtime state of one rule; not part of the persisted document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleRuntime {
    /// Last observed overall match state
    pub last_match: MatchState,

    /// A sequence is currently executing for this rule
    pub running: bool,

    /// When the rule last fired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Edge decision for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDecision {
    /// First observation since load/edit; recorded, never fires
    First,

    /// Match state unchanged
    NoChange,

    /// unmatched → matched; selects the then sequence
    Rising,

    /// matched → unmatched; selects the else sequence
    Falling,
}

/// Per-rule transition and firing state
pub struct TransitionTracker {
    runtime: DashMap<String, RuleRuntime>,
}

impl TransitionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            runtime: DashMap::new(),
        }
    }

    /// Record a new match boolean and classify the transition
    ///
    /// `last_match` always advances, even when the caller later blocks the
    /// firing on cooldown or prerequisites: the edge is consumed and will
    /// not fire retroactively.
    pub fn observe(&self, rule_id: &str, matched: bool) -> EdgeDecision {
        let mut entry = self.runtime.entry(rule_id.to_string()).or_default();

        let new_state = if matched {
            MatchState::Matched
        } else {
            MatchState::Unmatched
        };

        let decision = match entry.last_match {
            MatchState::Unknown => EdgeDecision::First,
            previous if previous == new_state => EdgeDecision::NoChange,
            MatchState::Unmatched => EdgeDecision::Rising,
            MatchState::Matched => EdgeDecision::Falling,
        };

        entry.last_match = new_state;
        decision
    }

    /// Seconds of cooldown still remaining, if the gate is closed
    pub fn cooldown_remaining(
        &self,
        rule_id: &str,
        cooldown_secs: f64,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if cooldown_secs <= 0.0 {
            return None;
        }

        let fired_at = self.runtime.get(rule_id)?.last_fired_at?;
        let elapsed = (now - fired_at).num_milliseconds() as f64 / 1000.0;

        if elapsed < cooldown_secs {
            Some(cooldown_secs - elapsed)
        } else {
            None
        }
    }

    /// Claim the running slot and stamp `last_fired_at`
    ///
    /// Returns false when a sequence is already executing; the caller
    /// drops the trigger (logged, never queued).
    pub fn try_begin_run(&self, rule_id: &str, now: DateTime<Utc>) -> bool {
        let mut entry = self.runtime.entry(rule_id.to_string()).or_default();
        if entry.running {
            return false;
        }
        entry.running = true;
        entry.last_fired_at = Some(now);
        true
    }

    /// Release the running slot after a sequence reaches a terminal state
    pub fn finish_run(&self, rule_id: &str) {
        if let Some(mut entry) = self.runtime.get_mut(rule_id) {
            entry.running = false;
        }
    }

    /// Forget a rule's runtime state (on load/edit/delete)
    pub fn reset(&self, rule_id: &str) {
        self.runtime.remove(rule_id);
    }

    /// Snapshot of a rule's runtime state for the control surface
    pub fn snapshot(&self, rule_id: &str) -> RuleRuntime {
        self.runtime
            .get(rule_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

impl Default for TransitionTracker {
    fn default() -> Self {
        Self::new()
    }
}
