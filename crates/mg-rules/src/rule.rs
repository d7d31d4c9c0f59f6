//! Rule definitions
//!
//! A rule watches one source device, detects transitions of its compound
//! match state, and runs a step sequence when an edge occurs. Rules enter
//! the engine as `RuleConfig` documents and are structurally validated at
//! that boundary; evaluation never sees a malformed rule.

use mg_core::{CompareOp, Ieee};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{validate_steps, Step};
use crate::store::StoreError;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Invalid rule: {0}")]
    Invalid(String),

    #[error("Rule store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for rule operations
pub type RuleResult<T> = Result<T, RuleError>;

/// One debounced comparison against a source-device attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Attribute name on the source device
    pub attribute: String,

    /// Comparison operator
    pub operator: CompareOp,

    /// Threshold; a list when the operator is in/nin
    pub value: serde_json::Value,

    /// Seconds the comparison must hold continuously; 0 = instantaneous
    #[serde(default)]
    pub sustain: f64,
}

/// One-shot external state check performed at firing time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    /// Device to check (any device, not just the source)
    pub ieee: Ieee,

    /// Attribute name on that device
    pub attribute: String,

    /// Comparison operator
    pub operator: CompareOp,

    /// Threshold; a list when the operator is in/nin
    pub value: serde_json::Value,

    /// Invert the comparison result
    #[serde(default)]
    pub negate: bool,
}

/// Rule document as created/edited through the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique ID (auto-generated if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Device whose attribute changes trigger evaluation
    pub source_ieee: Ieee,

    /// Conditions, combined with logical AND
    pub conditions: Vec<Condition>,

    /// Prerequisites, combined with logical AND, checked at firing time
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,

    /// Steps run on the unmatched→matched edge
    #[serde(default)]
    pub then_sequence: Vec<Step>,

    /// Steps run on the matched→unmatched edge
    #[serde(default)]
    pub else_sequence: Vec<Step>,

    /// Minimum seconds between successive firings
    #[serde(default)]
    pub cooldown: f64,

    /// Whether the rule participates in evaluation
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleConfig {
    /// Structural validation, applied at create/update time
    pub fn validate(&self) -> RuleResult<()> {
        if self.conditions.is_empty() {
            return Err(RuleError::Invalid(
                "rule needs at least one condition".to_string(),
            ));
        }
        if self.then_sequence.is_empty() && self.else_sequence.is_empty() {
            return Err(RuleError::Invalid(
                "rule needs a then_sequence or an else_sequence".to_string(),
            ));
        }
        if self.cooldown < 0.0 {
            return Err(RuleError::Invalid("cooldown cannot be negative".to_string()));
        }

        for (i, condition) in self.conditions.iter().enumerate() {
            if condition.sustain < 0.0 {
                return Err(RuleError::Invalid(format!(
                    "condition {}: sustain cannot be negative",
                    i
                )));
            }
            check_operand(condition.operator, &condition.value)
                .map_err(|e| RuleError::Invalid(format!("condition {}: {}", i, e)))?;
        }

        for (i, prerequisite) in self.prerequisites.iter().enumerate() {
            check_operand(prerequisite.operator, &prerequisite.value)
                .map_err(|e| RuleError::Invalid(format!("prerequisite {}: {}", i, e)))?;
        }

        validate_steps(&self.then_sequence)
            .map_err(|e| RuleError::Invalid(format!("then_sequence: {}", e)))?;
        validate_steps(&self.else_sequence)
            .map_err(|e| RuleError::Invalid(format!("else_sequence: {}", e)))?;

        Ok(())
    }
}

/// The list operators take a list threshold, everything else a scalar
pub(crate) fn check_operand(op: CompareOp, value: &serde_json::Value) -> Result<(), String> {
    let is_list = value.is_array();
    match op {
        CompareOp::In | CompareOp::Nin if !is_list => {
            Err(format!("operator '{}' needs a list value", op))
        }
        CompareOp::In | CompareOp::Nin => Ok(()),
        _ if is_list => Err(format!("operator '{}' takes a scalar value", op)),
        _ if value.is_null() || value.is_object() => {
            Err(format!("operator '{}' needs a scalar value", op))
        }
        _ => Ok(()),
    }
}

/// A loaded rule with its assigned id
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Human-readable label
    pub name: Option<String>,

    /// Device whose attribute changes trigger evaluation
    pub source_ieee: Ieee,

    /// Conditions, combined with logical AND
    pub conditions: Vec<Condition>,

    /// Prerequisites, checked once at firing time
    pub prerequisites: Vec<Prerequisite>,

    /// Steps for the unmatched→matched edge
    pub then_sequence: Vec<Step>,

    /// Steps for the matched→unmatched edge
    pub else_sequence: Vec<Step>,

    /// Minimum seconds between successive firings
    pub cooldown: f64,

    /// Whether the rule participates in evaluation
    pub enabled: bool,
}

impl Rule {
    /// Create from a validated config, assigning an id if needed
    pub fn from_config(config: RuleConfig) -> Self {
        let id = config.id.unwrap_or_else(|| ulid::Ulid::new().to_string());

        Self {
            id,
            name: config.name,
            source_ieee: config.source_ieee,
            conditions: config.conditions,
            prerequisites: config.prerequisites,
            then_sequence: config.then_sequence,
            else_sequence: config.else_sequence,
            cooldown: config.cooldown,
            enabled: config.enabled,
        }
    }

    /// Get display name (label or id)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// The persistable document form of this rule
    pub fn to_config(&self) -> RuleConfig {
        RuleConfig {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            source_ieee: self.source_ieee,
            conditions: self.conditions.clone(),
            prerequisites: self.prerequisites.clone(),
            then_sequence: self.then_sequence.clone(),
            else_sequence: self.else_sequence.clone(),
            cooldown: self.cooldown,
            enabled: self.enabled,
        }
    }
}
