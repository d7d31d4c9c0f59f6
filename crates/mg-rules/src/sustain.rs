//! Sustain (debounce) timers for rule conditions
//!
//! A condition with `sustain` only counts as true once its raw comparison
//! has held continuously for the configured duration. Timer state lives in
//! an explicit map keyed by `(rule_id, condition_index)` and is evicted
//! whenever a rule is deleted or edited.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Effective status of a debounced comparison
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SustainStatus {
    /// Comparison true and the sustain window (if any) has elapsed
    Satisfied,

    /// Comparison true but still inside the sustain window
    Waiting {
        /// Seconds the comparison has held so far
        elapsed: f64,
    },

    /// Comparison false; the window was reset
    NotHeld,
}

/// Per-condition debounce timer state
pub struct SustainTracker {
    /// When each (rule, condition) first became true, while it stays true
    held_since: DashMap<(String, usize), DateTime<Utc>>,
}

impl SustainTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            held_since: DashMap::new(),
        }
    }

    /// Feed one raw comparison result and get the effective status
    ///
    /// A false comparison clears the window: holding for 9 of 10 seconds
    /// and dropping out earns no partial credit.
    pub fn observe(
        &self,
        rule_id: &str,
        index: usize,
        raw_true: bool,
        sustain_secs: f64,
        now: DateTime<Utc>,
    ) -> SustainStatus {
        let key = (rule_id.to_string(), index);

        if !raw_true {
            self.held_since.remove(&key);
            return SustainStatus::NotHeld;
        }

        if sustain_secs <= 0.0 {
            return SustainStatus::Satisfied;
        }

        let since = *self.held_since.entry(key).or_insert(now);
        let elapsed = (now - since).num_milliseconds() as f64 / 1000.0;

        if elapsed >= sustain_secs {
            SustainStatus::Satisfied
        } else {
            SustainStatus::Waiting { elapsed }
        }
    }

    /// Drop all timer state belonging to a rule
    pub fn evict_rule(&self, rule_id: &str) {
        self.held_since.retain(|(rid, _), _| rid != rule_id);
    }

    /// Number of live timer windows
    pub fn window_count(&self) -> usize {
        self.held_since.len()
    }
}

impl Default for SustainTracker {
    fn default() -> Self {
        Self::new()
    }
}
