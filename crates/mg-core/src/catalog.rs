//! Per-device attribute and command catalogs
//!
//! Rule-building clients need to know what a device can report and accept.
//! Catalogs are assembled from the device shadow rather than hard-coded,
//! so they track whatever each device model actually exposes.

use serde::{Deserialize, Serialize};

use crate::value::{AttrType, AttrValue, CompareOp};

/// One entry of a device's attribute catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Attribute name (e.g., "occupancy", "temperature")
    pub name: String,

    /// Last reported value
    pub value: AttrValue,

    /// Declared type of the attribute
    #[serde(rename = "type")]
    pub attr_type: AttrType,

    /// Operators valid for this attribute in rule conditions
    pub operators: Vec<CompareOp>,

    /// Enumerated value options, for enum-string attributes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// One entry of a device's command catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Command name (e.g., "on", "set_level")
    pub name: String,

    /// Endpoint the command addresses, for multi-endpoint devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<u8>,

    /// Type of the value the command accepts, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_hint: Option<AttrType>,
}
