//! Automation rule engine for meshgate
//!
//! A rule watches one source device and reacts to *transitions* of its
//! compound match state, not to levels: repeated matched evaluations never
//! re-fire. Edges pass a cooldown gate and one-shot prerequisites before
//! the rule's step sequence runs as its own task.
//!
//! # Architecture
//!
//! ```text
//! RULE = CONDITIONS (sustained) → EDGE → COOLDOWN → PREREQUISITES → SEQUENCE
//! ```
//!
//! - **Conditions**: debounced comparisons against the source device
//! - **Transitions**: per-rule edge detection with a cooldown gate
//! - **Prerequisites**: one-shot external checks at firing time
//! - **Sequence**: a recursive step tree (commands, delays, waits, gates,
//!   branches, parallel sub-sequences) run by the interpreter
//! - **Trace**: every decision lands in a bounded, queryable ring
//!
//! # Key Types
//!
//! - [`Rule`] / [`RuleConfig`] - the rule document
//! - [`Step`] - one node of the sequence tree
//! - [`RuleEngine`] - the façade wiring everything to the change feed
//! - [`TraceRecorder`] - the execution trace ring

pub mod engine;
pub mod evaluate;
pub mod interpreter;
pub mod rule;
pub mod step;
pub mod store;
pub mod sustain;
pub mod trace;
pub mod transition;

pub use engine::{EngineSettings, RuleEngine, RuleView};
pub use evaluate::{CheckDetail, EvalSummary, Evaluator};
pub use interpreter::{Outcome, SequenceInterpreter};
pub use rule::{Condition, Prerequisite, Rule, RuleConfig, RuleError, RuleResult};
pub use step::{InlineCondition, Logic, Step};
pub use store::{MemoryRuleStore, RuleStore, StoreError, StoreResult};
pub use sustain::{SustainStatus, SustainTracker};
pub use trace::{
    TraceEntry, TracePhase, TraceRecorder, TraceResult, DEFAULT_TRACE_CAPACITY, ENGINE_RULE_ID,
};
pub use transition::{EdgeDecision, MatchState, RuleRuntime, TransitionTracker};
