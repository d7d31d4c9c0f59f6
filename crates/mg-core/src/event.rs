//! Attribute-change feed event

use serde::{Deserialize, Serialize};

use crate::ieee::Ieee;

/// Fired on the shadow's broadcast feed whenever a device report lands
///
/// Carries which attributes the report updated (the value may be identical
/// to the previous one; periodic reports still drive rule re-evaluation).
/// Consumers read current values back from the shadow rather than from the
/// event, so a lagged subscriber never acts on stale values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeChanged {
    /// Device whose report landed
    pub ieee: Ieee,

    /// Names of the attributes updated by this report
    pub attributes: Vec<String>,
}
