//! Condition and prerequisite evaluation
//!
//! Conditions combine the comparator with per-condition sustain timers to
//! produce a rule's instantaneous match state. Prerequisites (and the
//! gate/wait/inline checks that share their shape) are one-shot lookups
//! against any device, never sustained. Missing attributes and coercion
//! failures fail closed: the check counts false and the reason is kept
//! for the trace.

use chrono::{DateTime, Utc};
use mg_core::{compare, AttrValue, CompareOp, Ieee};
use mg_shadow::StateProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use crate::rule::Rule;
use crate::sustain::{SustainStatus, SustainTracker};

/// Outcome of one condition/prerequisite/inline check, kept in the trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDetail {
    /// Condition index within the rule, for source-device conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    /// Device checked, for external (prerequisite-style) checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ieee: Option<Ieee>,

    /// Attribute name
    pub attribute: String,

    /// Comparison operator
    pub operator: CompareOp,

    /// Configured threshold
    pub expected: serde_json::Value,

    /// Value the device reported, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<AttrValue>,

    /// Effective result after sustain/negation
    pub satisfied: bool,

    /// Why the check did not produce a clean comparison
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Seconds the comparison has held, while a sustain window is open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_for: Option<f64>,
}

/// Result of evaluating a rule's full condition list
#[derive(Debug, Clone)]
pub struct EvalSummary {
    /// AND of all effective condition booleans
    pub matched: bool,

    /// At least one condition is true but still inside its sustain window
    pub sustain_pending: bool,

    /// Per-condition detail, one entry per condition (no short-circuit)
    pub checks: Vec<CheckDetail>,
}

/// Evaluates rule conditions and prerequisites against device state
pub struct Evaluator {
    provider: Arc<dyn StateProvider>,
    sustain: SustainTracker,
}

impl Evaluator {
    /// Create a new evaluator over a state provider
    pub fn new(provider: Arc<dyn StateProvider>) -> Self {
        Self {
            provider,
            sustain: SustainTracker::new(),
        }
    }

    /// Evaluate all conditions of a rule against its source device
    ///
    /// Every condition is checked and traced even when an earlier one has
    /// already failed: debuggability over micro-performance.
    pub async fn evaluate_conditions(&self, rule: &Rule, now: DateTime<Utc>) -> EvalSummary {
        let mut matched = true;
        let mut sustain_pending = false;
        let mut checks = Vec::with_capacity(rule.conditions.len());

        for (index, condition) in rule.conditions.iter().enumerate() {
            let lookup = self
                .provider
                .attribute(rule.source_ieee, &condition.attribute)
                .await;

            let (raw, actual, reason) = match lookup {
                None => (
                    false,
                    None,
                    Some(format!(
                        "attribute '{}' not reported by {}",
                        condition.attribute, rule.source_ieee
                    )),
                ),
                Some((value, _)) => match compare(&value, condition.operator, &condition.value) {
                    Ok(result) => (result, Some(value), None),
                    Err(e) => (false, Some(value), Some(e.to_string())),
                },
            };

            let status = self
                .sustain
                .observe(&rule.id, index, raw, condition.sustain, now);

            let (satisfied, held_for) = match status {
                SustainStatus::Satisfied => (true, None),
                SustainStatus::Waiting { elapsed } => {
                    sustain_pending = true;
                    (false, Some(elapsed))
                }
                SustainStatus::NotHeld => (false, None),
            };

            trace!(
                rule_id = %rule.id,
                index,
                attribute = %condition.attribute,
                raw,
                satisfied,
                "Condition evaluated"
            );

            matched &= satisfied;
            checks.push(CheckDetail {
                index: Some(index),
                ieee: None,
                attribute: condition.attribute.clone(),
                operator: condition.operator,
                expected: condition.value.clone(),
                actual,
                satisfied,
                reason,
                held_for,
            });
        }

        EvalSummary {
            matched,
            sustain_pending,
            checks,
        }
    }

    /// Check all prerequisites of a rule, once, at firing time
    pub async fn check_prerequisites(&self, rule: &Rule) -> (bool, Vec<CheckDetail>) {
        let mut pass = true;
        let mut checks = Vec::with_capacity(rule.prerequisites.len());

        for prerequisite in &rule.prerequisites {
            let detail = check_external(
                self.provider.as_ref(),
                prerequisite.ieee,
                &prerequisite.attribute,
                prerequisite.operator,
                &prerequisite.value,
                prerequisite.negate,
            )
            .await;

            pass &= detail.satisfied;
            checks.push(detail);
        }

        (pass, checks)
    }

    /// Drop sustain timer state for a rule (on delete/edit)
    pub fn evict_rule(&self, rule_id: &str) {
        self.sustain.evict_rule(rule_id);
    }
}

/// One-shot check of any device's attribute, with optional negation
///
/// Shared by prerequisites, gates, wait conditions, and inline conditions.
/// A missing attribute or a failed comparison counts false regardless of
/// `negate`; negation only applies to a comparison that actually ran.
pub async fn check_external(
    provider: &dyn StateProvider,
    ieee: Ieee,
    attribute: &str,
    operator: CompareOp,
    expected: &serde_json::Value,
    negate: bool,
) -> CheckDetail {
    let (satisfied, actual, reason) = match provider.attribute(ieee, attribute).await {
        None => (
            false,
            None,
            Some(format!("attribute '{}' not reported by {}", attribute, ieee)),
        ),
        Some((value, _)) => match compare(&value, operator, expected) {
            Ok(result) => (
                if negate { !result } else { result },
                Some(value),
                None,
            ),
            Err(e) => (false, Some(value), Some(e.to_string())),
        },
    };

    CheckDetail {
        index: None,
        ieee: Some(ieee),
        attribute: attribute.to_string(),
        operator,
        expected: expected.clone(),
        actual,
        satisfied,
        reason,
        held_for: None,
    }
}
