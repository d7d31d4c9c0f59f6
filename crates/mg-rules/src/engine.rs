//! Rule engine façade
//!
//! Wires the evaluator, transition tracker, and sequence interpreter to
//! the shadow's change feed and the outbound command sink, and owns the
//! rule set lifecycle. Events for one device are evaluated in arrival
//! order by a single engine task; each firing runs as its own spawned
//! task so `Delay`/`WaitFor` suspensions never block other rules.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use mg_core::AttributeChanged;
use mg_shadow::{CommandSink, StateProvider};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::evaluate::Evaluator;
use crate::interpreter::{SequenceInterpreter, DEFAULT_COMMAND_TIMEOUT};
use crate::rule::{Rule, RuleConfig, RuleError, RuleResult};
use crate::store::RuleStore;
use crate::trace::{
    TraceEntry, TracePhase, TraceRecorder, TraceResult, DEFAULT_TRACE_CAPACITY, ENGINE_RULE_ID,
};
use crate::transition::{EdgeDecision, RuleRuntime, TransitionTracker};

/// Tunables for the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Entries retained in the trace ring
    pub trace_capacity: usize,

    /// How long a command waits for its transport acknowledgement
    pub command_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// A rule document plus its runtime state, for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleView {
    #[serde(flatten)]
    pub rule: RuleConfig,

    #[serde(flatten)]
    pub runtime: RuleRuntime,
}

/// The rule engine
pub struct RuleEngine {
    /// Loaded rules by id
    rules: DashMap<String, Rule>,
    /// Condition/prerequisite evaluation (owns the sustain timers)
    evaluator: Evaluator,
    /// Per-rule transition, cooldown, and running state
    transitions: Arc<TransitionTracker>,
    /// Step tree executor
    interpreter: SequenceInterpreter,
    /// Shared trace ring
    trace: Arc<TraceRecorder>,
    /// Device state access
    provider: Arc<dyn StateProvider>,
    /// Durable rule document storage
    store: Arc<dyn RuleStore>,
    /// Whether the event loop is active
    running: AtomicBool,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl RuleEngine {
    /// Create an engine with default settings
    pub fn new(
        provider: Arc<dyn StateProvider>,
        sink: Arc<dyn CommandSink>,
        store: Arc<dyn RuleStore>,
    ) -> Self {
        Self::with_settings(provider, sink, store, EngineSettings::default())
    }

    /// Create an engine with explicit settings
    pub fn with_settings(
        provider: Arc<dyn StateProvider>,
        sink: Arc<dyn CommandSink>,
        store: Arc<dyn RuleStore>,
        settings: EngineSettings,
    ) -> Self {
        let trace = Arc::new(TraceRecorder::new(settings.trace_capacity));
        let interpreter = SequenceInterpreter::new(provider.clone(), sink, trace.clone())
            .with_command_timeout(settings.command_timeout);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            rules: DashMap::new(),
            evaluator: Evaluator::new(provider.clone()),
            transitions: Arc::new(TransitionTracker::new()),
            interpreter,
            trace,
            provider,
            store,
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// The shared trace recorder
    pub fn trace(&self) -> Arc<TraceRecorder> {
        self.trace.clone()
    }

    // --- Rule set lifecycle ---

    /// Load rules from the store, replacing the current set
    ///
    /// Runtime state resets to unknown for every loaded rule; a restart
    /// never resumes a sequence or inherits a stale match state. Invalid
    /// stored documents are skipped with a warning.
    pub async fn load(&self) -> RuleResult<usize> {
        let configs = self.store.load_all().await?;

        for entry in self.rules.iter() {
            self.transitions.reset(entry.key());
            self.evaluator.evict_rule(entry.key());
        }
        self.rules.clear();

        let mut count = 0;
        for config in configs {
            if let Err(e) = config.validate() {
                warn!(id = ?config.id, error = %e, "Skipping invalid stored rule");
                continue;
            }
            let rule = Rule::from_config(config);
            info!("Loaded rule: {} ({})", rule.display_name(), rule.id);
            self.transitions.reset(&rule.id);
            self.evaluator.evict_rule(&rule.id);
            self.rules.insert(rule.id.clone(), rule);
            count += 1;
        }

        self.trace.record(TraceEntry::new(
            ENGINE_RULE_ID,
            TracePhase::Evaluate,
            TraceResult::Engine,
            format!("loaded {} rules", count),
        ));

        Ok(count)
    }

    /// All rules with their runtime state, sorted by id
    pub fn list(&self) -> Vec<RuleView> {
        let mut views: Vec<RuleView> = self.rules.iter().map(|r| self.view(r.value())).collect();
        views.sort_by(|a, b| a.rule.id.cmp(&b.rule.id));
        views
    }

    /// One rule by id
    pub fn get(&self, id: &str) -> RuleResult<RuleView> {
        self.rules
            .get(id)
            .map(|r| self.view(r.value()))
            .ok_or_else(|| RuleError::NotFound(id.to_string()))
    }

    /// Create a rule from a validated document
    pub async fn create(&self, config: RuleConfig) -> RuleResult<String> {
        config.validate()?;

        let rule = Rule::from_config(config);
        let id = rule.id.clone();

        if self.rules.contains_key(&id) {
            return Err(RuleError::Invalid(format!(
                "rule with id {} already exists",
                id
            )));
        }

        info!("Created rule: {} ({})", rule.display_name(), id);
        self.transitions.reset(&id);
        self.evaluator.evict_rule(&id);
        self.rules.insert(id.clone(), rule);
        self.persist().await?;
        Ok(id)
    }

    /// Replace a rule's definition, resetting its runtime state
    pub async fn update(&self, id: &str, mut config: RuleConfig) -> RuleResult<()> {
        if !self.rules.contains_key(id) {
            return Err(RuleError::NotFound(id.to_string()));
        }

        config.id = Some(id.to_string());
        config.validate()?;

        let rule = Rule::from_config(config);
        info!("Updated rule: {} ({})", rule.display_name(), id);
        self.transitions.reset(id);
        self.evaluator.evict_rule(id);
        self.rules.insert(id.to_string(), rule);
        self.persist().await
    }

    /// Delete a rule and evict its runtime state
    pub async fn delete(&self, id: &str) -> RuleResult<()> {
        let (_, rule) = self
            .rules
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;

        info!("Deleted rule: {} ({})", rule.display_name(), id);
        self.transitions.reset(id);
        self.evaluator.evict_rule(id);
        self.persist().await
    }

    /// Enable or disable a rule
    ///
    /// Disabling does not abort an in-flight sequence; it only blocks
    /// future firings. Runtime state is kept so re-enabling does not
    /// start from a fresh first observation.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> RuleResult<bool> {
        {
            let mut rule = self
                .rules
                .get_mut(id)
                .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
            rule.enabled = enabled;
            info!(
                "{} rule: {}",
                if enabled { "Enabled" } else { "Disabled" },
                rule.display_name()
            );
        }
        self.persist().await?;
        Ok(enabled)
    }

    /// Flip a rule's enabled flag
    pub async fn toggle(&self, id: &str) -> RuleResult<bool> {
        let enabled = !self
            .rules
            .get(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?
            .enabled;
        self.set_enabled(id, enabled).await
    }

    async fn persist(&self) -> RuleResult<()> {
        let mut configs: Vec<RuleConfig> = self.rules.iter().map(|r| r.to_config()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        self.store.save_all(&configs).await?;
        Ok(())
    }

    fn view(&self, rule: &Rule) -> RuleView {
        RuleView {
            rule: rule.to_config(),
            runtime: self.transitions.snapshot(&rule.id),
        }
    }

    // --- Event loop ---

    /// Start draining the change feed
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Rule engine already running");
            return;
        }

        info!("Starting rule engine");

        let mut feed = self.provider.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let engine = self;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Ok(event) => engine.process_change(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Rule engine lagged behind the change feed");
                            engine.trace.record(TraceEntry::new(
                                ENGINE_RULE_ID,
                                TracePhase::Evaluate,
                                TraceResult::Engine,
                                format!("change feed lagged, {} events skipped", skipped),
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Change feed closed, stopping rule engine");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }

            engine.running.store(false, Ordering::SeqCst);
            info!("Rule engine stopped");
        });
    }

    /// Signal the event loop to stop
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!("Stopping rule engine");
        let _ = self.shutdown_tx.send(());
    }

    /// Whether the event loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Evaluate all rules watching the event's source device
    pub async fn process_change(&self, event: &AttributeChanged) {
        self.process_change_at(event, Utc::now()).await;
    }

    /// Evaluation entry point with an explicit clock, for tests
    pub async fn process_change_at(&self, event: &AttributeChanged, now: DateTime<Utc>) {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| r.source_ieee == event.ieee)
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));

        for rule in rules {
            if !rule.enabled {
                debug!(rule_id = %rule.id, "Rule disabled, skipping evaluation");
                continue;
            }
            self.evaluate_rule(&rule, now).await;
        }
    }

    async fn evaluate_rule(&self, rule: &Rule, now: DateTime<Utc>) {
        let summary = self.evaluator.evaluate_conditions(rule, now).await;

        let (result, message) = if summary.matched {
            (TraceResult::Matched, "conditions matched")
        } else if summary.sustain_pending {
            (TraceResult::SustainWait, "conditions held, waiting out sustain")
        } else {
            (TraceResult::Unmatched, "conditions not matched")
        };

        self.trace.record(
            TraceEntry::new(&rule.id, TracePhase::Evaluate, result, message)
                .with_checks(summary.checks),
        );

        match self.transitions.observe(&rule.id, summary.matched) {
            EdgeDecision::First => {
                self.trace.record(TraceEntry::new(
                    &rule.id,
                    TracePhase::Evaluate,
                    TraceResult::FirstObservation,
                    "first observation recorded, no firing",
                ));
            }
            EdgeDecision::NoChange => {}
            EdgeDecision::Rising => self.handle_edge(rule, true, now).await,
            EdgeDecision::Falling => self.handle_edge(rule, false, now).await,
        }
    }

    /// Gate an edge through cooldown, prerequisites, and the running flag,
    /// then hand the selected sequence to a spawned interpreter task.
    ///
    /// `last_match` has already advanced: a blocked edge is consumed and
    /// never fires retroactively.
    async fn handle_edge(&self, rule: &Rule, rising: bool, now: DateTime<Utc>) {
        let (steps, branch) = if rising {
            (&rule.then_sequence, "then")
        } else {
            (&rule.else_sequence, "else")
        };

        if steps.is_empty() {
            debug!(rule_id = %rule.id, branch, "Edge with empty sequence, nothing to run");
            return;
        }

        if let Some(remaining) = self
            .transitions
            .cooldown_remaining(&rule.id, rule.cooldown, now)
        {
            self.trace.record(TraceEntry::new(
                &rule.id,
                TracePhase::Fire,
                TraceResult::Blocked,
                format!("cooldown active, {:.1}s remaining", remaining),
            ));
            return;
        }

        let mut prereq_checks = Vec::new();
        if !rule.prerequisites.is_empty() {
            let (pass, checks) = self.evaluator.check_prerequisites(rule).await;
            if !pass {
                self.trace.record(
                    TraceEntry::new(
                        &rule.id,
                        TracePhase::Fire,
                        TraceResult::Blocked,
                        "prerequisites not met",
                    )
                    .with_checks(checks),
                );
                return;
            }
            prereq_checks = checks;
        }

        if !self.transitions.try_begin_run(&rule.id, now) {
            self.trace.record(TraceEntry::new(
                &rule.id,
                TracePhase::Fire,
                TraceResult::Skipped,
                "sequence already running, trigger dropped",
            ));
            return;
        }

        self.trace.record(
            TraceEntry::new(
                &rule.id,
                TracePhase::Fire,
                TraceResult::Firing,
                format!("firing {} sequence", branch),
            )
            .with_checks(prereq_checks),
        );

        let interpreter = self.interpreter.clone();
        let transitions = self.transitions.clone();
        let trace = self.trace.clone();
        let rule_id = rule.id.clone();
        let steps = steps.clone();

        tokio::spawn(async move {
            // The task boundary: nothing escapes into other rules' tasks
            // or the event loop.
            let run = AssertUnwindSafe(interpreter.run(&rule_id, &steps))
                .catch_unwind()
                .await;

            match run {
                Ok(outcome) => {
                    trace.record(TraceEntry::new(
                        &rule_id,
                        TracePhase::Complete,
                        outcome.as_trace_result(),
                        format!("sequence finished: {}", outcome),
                    ));
                }
                Err(_) => {
                    trace.record(
                        TraceEntry::new(
                            &rule_id,
                            TracePhase::Complete,
                            TraceResult::Exception,
                            "sequence task panicked",
                        )
                        .with_error("panic in sequence task"),
                    );
                }
            }

            transitions.finish_run(&rule_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Condition;
    use crate::step::Step;
    use crate::store::MemoryRuleStore;
    use async_trait::async_trait;
    use mg_core::{CompareOp, Ieee};
    use mg_shadow::{DeviceShadow, DispatchError, OutboundCommand};
    use serde_json::json;

    /// Sink that accepts everything silently
    struct NullSink;

    #[async_trait]
    impl CommandSink for NullSink {
        async fn send_command(&self, _command: OutboundCommand) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn sample_config(id: Option<&str>) -> RuleConfig {
        RuleConfig {
            id: id.map(|s| s.to_string()),
            name: None,
            source_ieee: Ieee::new(0xA1),
            conditions: vec![Condition {
                attribute: "occupancy".to_string(),
                operator: CompareOp::Eq,
                value: json!(true),
                sustain: 0.0,
            }],
            prerequisites: Vec::new(),
            then_sequence: vec![Step::Command {
                target_ieee: Ieee::new(0xD1),
                command: "on".to_string(),
                value: None,
                endpoint_id: None,
            }],
            else_sequence: Vec::new(),
            cooldown: 0.0,
            enabled: true,
        }
    }

    fn make_engine(store: Arc<MemoryRuleStore>) -> RuleEngine {
        let shadow = Arc::new(DeviceShadow::new());
        RuleEngine::new(shadow, Arc::new(NullSink), store)
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = Arc::new(MemoryRuleStore::new());
        let engine = make_engine(store.clone());

        let id = engine.create(sample_config(Some("r1"))).await.unwrap();
        assert_eq!(id, "r1");

        let view = engine.get("r1").unwrap();
        assert!(view.rule.enabled);
        assert!(!view.runtime.running);
        assert_eq!(engine.list().len(), 1);

        // Persisted through the store
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        engine.delete("r1").await.unwrap();
        assert!(matches!(engine.get("r1"), Err(RuleError::NotFound(_))));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let engine = make_engine(Arc::new(MemoryRuleStore::new()));

        let mut invalid = sample_config(None);
        invalid.conditions.clear();
        assert!(matches!(
            engine.create(invalid).await,
            Err(RuleError::Invalid(_))
        ));

        engine.create(sample_config(Some("r1"))).await.unwrap();
        assert!(matches!(
            engine.create(sample_config(Some("r1"))).await,
            Err(RuleError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_update_resets_runtime() {
        let engine = make_engine(Arc::new(MemoryRuleStore::new()));
        engine.create(sample_config(Some("r1"))).await.unwrap();

        // Establish a known match state
        engine.transitions.observe("r1", true);
        assert_ne!(
            engine.get("r1").unwrap().runtime.last_match,
            crate::transition::MatchState::Unknown
        );

        engine
            .update("r1", sample_config(Some("r1")))
            .await
            .unwrap();
        assert_eq!(
            engine.get("r1").unwrap().runtime.last_match,
            crate::transition::MatchState::Unknown
        );

        assert!(matches!(
            engine.update("missing", sample_config(None)).await,
            Err(RuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle() {
        let engine = make_engine(Arc::new(MemoryRuleStore::new()));
        engine.create(sample_config(Some("r1"))).await.unwrap();

        assert!(!engine.toggle("r1").await.unwrap());
        assert!(!engine.get("r1").unwrap().rule.enabled);
        assert!(engine.toggle("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_skips_invalid_documents() {
        let mut bad = sample_config(Some("bad"));
        bad.then_sequence.clear();

        let store = Arc::new(MemoryRuleStore::with_rules(vec![
            sample_config(Some("good")),
            bad,
        ]));
        let engine = make_engine(store);

        let count = engine.load().await.unwrap();
        assert_eq!(count, 1);
        assert!(engine.get("good").is_ok());
        assert!(engine.get("bad").is_err());

        // Load is recorded as an engine-level trace entry
        let engine_entries = engine.trace().query(Some(ENGINE_RULE_ID));
        assert_eq!(engine_entries.len(), 1);
    }

    #[tokio::test]
    async fn test_load_replaces_existing_rules() {
        let store = Arc::new(MemoryRuleStore::new());
        let engine = make_engine(store.clone());
        engine.create(sample_config(Some("transient"))).await.unwrap();

        // The store's content changed behind the engine's back
        store
            .save_all(&[sample_config(Some("stored"))])
            .await
            .unwrap();
        engine.load().await.unwrap();

        assert!(engine.get("stored").is_ok());
        assert!(engine.get("transient").is_err());
    }
}
