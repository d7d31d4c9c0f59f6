//! Execution trace recorder
//!
//! Every evaluation and execution decision lands here as a structured
//! entry: there is no silent failure mode. The recorder is a bounded ring
//! shared by all engine tasks; entries are immutable once appended and
//! the oldest are evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::evaluate::CheckDetail;

/// Sentinel rule id for engine-level, non-rule-specific entries
pub const ENGINE_RULE_ID: &str = "__engine__";

/// Default number of entries kept in the ring
pub const DEFAULT_TRACE_CAPACITY: usize = 500;

/// Which stage of the pipeline produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    Evaluate,
    Fire,
    Step,
    Complete,
}

/// Enumerated outcome of a traced decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceResult {
    // Evaluation
    Matched,
    Unmatched,
    SustainWait,
    FirstObservation,

    // Firing decisions
    Blocked,
    Skipped,
    Firing,

    // Steps
    CmdOk,
    CmdFail,
    WaitMet,
    WaitTimeout,
    GatePass,
    GateFail,
    IfTrue,
    IfFalse,
    ParallelDone,

    // Terminal states
    Complete,
    Failed,
    Cancelled,
    Exception,

    // Engine-level
    Engine,
}

/// One structured trace entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// When the decision was made
    pub timestamp: DateTime<Utc>,

    /// Rule the entry belongs to, or [`ENGINE_RULE_ID`]
    pub rule_id: String,

    /// Pipeline stage
    pub phase: TracePhase,

    /// Enumerated outcome
    pub result: TraceResult,

    /// Human-readable summary
    pub message: String,

    /// Per-condition/prerequisite/inline-check detail
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckDetail>,

    /// Error text for failures and exceptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceEntry {
    /// Create an entry stamped with the current time
    pub fn new(
        rule_id: impl Into<String>,
        phase: TracePhase,
        result: TraceResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            rule_id: rule_id.into(),
            phase,
            result,
            message: message.into(),
            checks: Vec::new(),
            error: None,
        }
    }

    /// Attach check details
    pub fn with_checks(mut self, checks: Vec<CheckDetail>) -> Self {
        self.checks = checks;
        self
    }

    /// Attach an error text
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Bounded, append-only ring of trace entries
pub struct TraceRecorder {
    entries: RwLock<VecDeque<TraceEntry>>,
    capacity: usize,
}

impl TraceRecorder {
    /// Create a recorder holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest if the ring is full
    pub fn record(&self, entry: TraceEntry) {
        if let Ok(mut entries) = self.entries.write() {
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Entries, most recent first, optionally filtered by rule id
    pub fn query(&self, rule_id: Option<&str>) -> Vec<TraceEntry> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|e| rule_id.map(|id| e.rule_id == id).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}
