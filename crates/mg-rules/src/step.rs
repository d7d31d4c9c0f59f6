//! Step tree types
//!
//! A sequence is a tree, not a flat list: `IfThenElse` and `Parallel`
//! nest arbitrary sub-sequences. Steps own their children by value so the
//! step-specific fields stay statically checked.

use mg_core::{AttrValue, CompareOp, Ieee};
use serde::{Deserialize, Serialize};

use crate::rule::check_operand;

/// One step of a rule sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Send a command to a device and await the transport ack
    Command {
        target_ieee: Ieee,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<AttrValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint_id: Option<u8>,
    },

    /// Suspend this sequence only
    Delay { seconds: f64 },

    /// Wait until a device attribute satisfies the comparison, or time out
    WaitFor {
        ieee: Ieee,
        attribute: String,
        operator: CompareOp,
        value: serde_json::Value,
        #[serde(default)]
        negate: bool,
        timeout: f64,
    },

    /// One-shot prerequisite-style check inline in the sequence
    Gate {
        ieee: Ieee,
        attribute: String,
        operator: CompareOp,
        value: serde_json::Value,
        #[serde(default)]
        negate: bool,
    },

    /// Conditional branch over inline checks combined with AND/OR
    IfThenElse {
        conditions: Vec<InlineCondition>,
        logic: Logic,
        #[serde(default)]
        then_steps: Vec<Step>,
        #[serde(default)]
        else_steps: Vec<Step>,
    },

    /// Run every branch concurrently; wait for all of them
    Parallel { branches: Vec<Vec<Step>> },
}

/// One inline check of an `IfThenElse` step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineCondition {
    pub ieee: Ieee,
    pub attribute: String,
    pub operator: CompareOp,
    pub value: serde_json::Value,
    #[serde(default)]
    pub negate: bool,
}

/// How inline conditions combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

/// Structural validation of a step list, recursing into nested sequences
pub(crate) fn validate_steps(steps: &[Step]) -> Result<(), String> {
    for (i, step) in steps.iter().enumerate() {
        match step {
            Step::Command { command, .. } => {
                if command.is_empty() {
                    return Err(format!("step {}: command name cannot be empty", i));
                }
            }
            Step::Delay { seconds } => {
                if *seconds < 0.0 {
                    return Err(format!("step {}: delay cannot be negative", i));
                }
            }
            Step::WaitFor {
                operator,
                value,
                timeout,
                ..
            } => {
                if *timeout <= 0.0 {
                    return Err(format!("step {}: wait_for needs a positive timeout", i));
                }
                check_operand(*operator, value).map_err(|e| format!("step {}: {}", i, e))?;
            }
            Step::Gate {
                operator, value, ..
            } => {
                check_operand(*operator, value).map_err(|e| format!("step {}: {}", i, e))?;
            }
            Step::IfThenElse {
                conditions,
                then_steps,
                else_steps,
                ..
            } => {
                if conditions.is_empty() {
                    return Err(format!("step {}: if_then_else needs conditions", i));
                }
                if then_steps.is_empty() && else_steps.is_empty() {
                    return Err(format!("step {}: if_then_else needs a branch", i));
                }
                for (j, condition) in conditions.iter().enumerate() {
                    check_operand(condition.operator, &condition.value)
                        .map_err(|e| format!("step {} condition {}: {}", i, j, e))?;
                }
                validate_steps(then_steps).map_err(|e| format!("step {} then: {}", i, e))?;
                validate_steps(else_steps).map_err(|e| format!("step {} else: {}", i, e))?;
            }
            Step::Parallel { branches } => {
                if branches.len() < 2 {
                    return Err(format!("step {}: parallel needs at least 2 branches", i));
                }
                for (j, branch) in branches.iter().enumerate() {
                    if branch.is_empty() {
                        return Err(format!("step {} branch {}: branch cannot be empty", i, j));
                    }
                    validate_steps(branch).map_err(|e| format!("step {} branch {}: {}", i, j, e))?;
                }
            }
        }
    }
    Ok(())
}
