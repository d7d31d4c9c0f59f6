//! Device shadow for meshgate
//!
//! This crate provides the `DeviceShadow`, which tracks the last reported
//! attributes of every device on the mesh. It fires `AttributeChanged`
//! events on a broadcast feed whenever a report lands and serves the
//! per-device attribute/command catalogs used by rule-building clients.
//!
//! It also defines the collaborator seams the rule engine depends on:
//! [`StateProvider`] (attribute lookup + change feed) and [`CommandSink`]
//! (outbound command dispatch with transport acknowledgement).

mod dispatch;
mod provider;

pub use dispatch::{DispatchRequest, QueuedDispatcher};
pub use provider::{CommandSink, DispatchError, OutboundCommand, StateProvider};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mg_core::{
    applicable_operators, AttrType, AttrValue, AttributeChanged, AttributeDescriptor,
    CommandDescriptor, Ieee,
};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default capacity of the attribute-change broadcast channel
const DEFAULT_FEED_CAPACITY: usize = 1024;

/// One attribute of a device's shadow state
#[derive(Debug, Clone)]
struct AttributeSlot {
    value: AttrValue,
    attr_type: AttrType,
    options: Option<Vec<String>>,
    last_updated: DateTime<Utc>,
}

/// Everything the gateway knows about one device
#[derive(Debug, Clone, Default)]
struct DeviceRecord {
    attributes: HashMap<String, AttributeSlot>,
    commands: Vec<CommandDescriptor>,
}

/// The device shadow tracks each device's last reported attributes
///
/// The shadow is responsible for:
/// - Storing the current value and declared type of every attribute
/// - Firing `AttributeChanged` on the broadcast feed for every report
/// - Serving the attribute/command catalogs for rule-building clients
/// - Providing thread-safe concurrent access for evaluation tasks
pub struct DeviceShadow {
    /// Device records keyed by IEEE address
    devices: DashMap<Ieee, DeviceRecord>,
    /// Broadcast feed of landed reports
    feed: broadcast::Sender<AttributeChanged>,
}

impl DeviceShadow {
    /// Create a new shadow with the default feed capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create a new shadow with the given feed capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            devices: DashMap::new(),
            feed,
        }
    }

    /// Apply an attribute report from a device
    ///
    /// Each attribute's declared type follows the reported value. The
    /// resulting `AttributeChanged` lists every attribute the report
    /// touched; subscribers re-read current values from the shadow.
    pub fn apply_report(&self, ieee: Ieee, report: HashMap<String, AttrValue>) {
        if report.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(report.len());

        {
            let mut record = self.devices.entry(ieee).or_default();
            for (name, value) in report {
                trace!(%ieee, attribute = %name, value = %value, "Applying attribute report");
                let attr_type = value.attr_type();
                record
                    .attributes
                    .entry(name.clone())
                    .and_modify(|slot| {
                        slot.value = value.clone();
                        slot.attr_type = attr_type;
                        slot.last_updated = now;
                    })
                    .or_insert(AttributeSlot {
                        value,
                        attr_type,
                        options: None,
                        last_updated: now,
                    });
                updated.push(name);
            }
        }

        debug!(%ieee, count = updated.len(), "Device report applied");

        // Send errors just mean no active subscribers
        let _ = self.feed.send(AttributeChanged {
            ieee,
            attributes: updated,
        });
    }

    /// Declare the enumerated value options of an attribute
    ///
    /// Options come from the device interview; they feed the attribute
    /// catalog so clients can offer a value picker for enum strings.
    pub fn declare_options(&self, ieee: Ieee, attribute: &str, options: Vec<String>) {
        if let Some(mut record) = self.devices.get_mut(&ieee) {
            if let Some(slot) = record.attributes.get_mut(attribute) {
                slot.options = Some(options);
            }
        }
    }

    /// Register the commands a device accepts
    pub fn register_commands(&self, ieee: Ieee, commands: Vec<CommandDescriptor>) {
        let mut record = self.devices.entry(ieee).or_default();
        record.commands = commands;
        debug!(%ieee, count = record.commands.len(), "Registered device commands");
    }

    /// Get the current value and declared type of an attribute
    pub fn attribute(&self, ieee: Ieee, attribute: &str) -> Option<(AttrValue, AttrType)> {
        self.devices.get(&ieee).and_then(|record| {
            record
                .attributes
                .get(attribute)
                .map(|slot| (slot.value.clone(), slot.attr_type))
        })
    }

    /// Build the attribute catalog for a device
    pub fn attribute_catalog(&self, ieee: Ieee) -> Vec<AttributeDescriptor> {
        let Some(record) = self.devices.get(&ieee) else {
            return Vec::new();
        };

        let mut catalog: Vec<AttributeDescriptor> = record
            .attributes
            .iter()
            .map(|(name, slot)| AttributeDescriptor {
                name: name.clone(),
                value: slot.value.clone(),
                attr_type: slot.attr_type,
                operators: applicable_operators(slot.attr_type).to_vec(),
                options: slot.options.clone(),
            })
            .collect();

        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Get the command catalog for a device
    pub fn command_catalog(&self, ieee: Ieee) -> Vec<CommandDescriptor> {
        self.devices
            .get(&ieee)
            .map(|record| record.commands.clone())
            .unwrap_or_default()
    }

    /// All known device addresses
    pub fn device_ids(&self) -> Vec<Ieee> {
        let mut ids: Vec<Ieee> = self.devices.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    /// Number of known devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Subscribe to the attribute-change feed
    pub fn subscribe(&self) -> broadcast::Receiver<AttributeChanged> {
        self.feed.subscribe()
    }
}

impl Default for DeviceShadow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateProvider for DeviceShadow {
    async fn attribute(&self, ieee: Ieee, attribute: &str) -> Option<(AttrValue, AttrType)> {
        DeviceShadow::attribute(self, ieee, attribute)
    }

    fn subscribe(&self) -> broadcast::Receiver<AttributeChanged> {
        DeviceShadow::subscribe(self)
    }
}

/// Thread-safe wrapper for DeviceShadow
pub type SharedDeviceShadow = Arc<DeviceShadow>;

#[cfg(test)]
mod tests {
    use super::*;
    use mg_core::CompareOp;

    fn ieee(n: u64) -> Ieee {
        Ieee::new(n)
    }

    #[tokio::test]
    async fn test_apply_report_and_lookup() {
        let shadow = DeviceShadow::new();
        shadow.apply_report(
            ieee(1),
            HashMap::from([
                ("occupancy".to_string(), AttrValue::Bool(true)),
                ("temperature".to_string(), AttrValue::Float(21.5)),
            ]),
        );

        let (value, ty) = shadow.attribute(ieee(1), "occupancy").unwrap();
        assert_eq!(value, AttrValue::Bool(true));
        assert_eq!(ty, AttrType::Boolean);

        assert!(shadow.attribute(ieee(1), "humidity").is_none());
        assert!(shadow.attribute(ieee(2), "occupancy").is_none());
    }

    #[tokio::test]
    async fn test_feed_carries_updated_attributes() {
        let shadow = DeviceShadow::new();
        let mut rx = shadow.subscribe();

        shadow.apply_report(
            ieee(7),
            HashMap::from([("state".to_string(), AttrValue::Str("ON".to_string()))]),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ieee, ieee(7));
        assert_eq!(event.attributes, vec!["state".to_string()]);
    }

    #[tokio::test]
    async fn test_unchanged_report_still_fires() {
        let shadow = DeviceShadow::new();
        let mut rx = shadow.subscribe();

        let report = HashMap::from([("occupancy".to_string(), AttrValue::Bool(true))]);
        shadow.apply_report(ieee(7), report.clone());
        shadow.apply_report(ieee(7), report);

        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_attribute_catalog() {
        let shadow = DeviceShadow::new();
        shadow.apply_report(
            ieee(3),
            HashMap::from([
                ("mode".to_string(), AttrValue::Str("eco".to_string())),
                ("level".to_string(), AttrValue::Int(128)),
            ]),
        );
        shadow.declare_options(
            ieee(3),
            "mode",
            vec!["eco".to_string(), "home".to_string(), "away".to_string()],
        );

        let catalog = shadow.attribute_catalog(ieee(3));
        assert_eq!(catalog.len(), 2);

        // Sorted by name: level, mode
        assert_eq!(catalog[0].name, "level");
        assert!(catalog[0].operators.contains(&CompareOp::Gt));

        assert_eq!(catalog[1].name, "mode");
        assert_eq!(catalog[1].options.as_ref().unwrap().len(), 3);
        assert!(!catalog[1].operators.contains(&CompareOp::Lt));
    }

    #[tokio::test]
    async fn test_command_catalog() {
        let shadow = DeviceShadow::new();
        shadow.register_commands(
            ieee(4),
            vec![CommandDescriptor {
                name: "set_level".to_string(),
                endpoint_id: Some(1),
                value_hint: Some(AttrType::Integer),
            }],
        );

        let commands = shadow.command_catalog(ieee(4));
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "set_level");

        assert!(shadow.command_catalog(ieee(9)).is_empty());
    }

    #[tokio::test]
    async fn test_device_ids_sorted() {
        let shadow = DeviceShadow::new();
        shadow.apply_report(
            ieee(9),
            HashMap::from([("a".to_string(), AttrValue::Int(1))]),
        );
        shadow.apply_report(
            ieee(2),
            HashMap::from([("a".to_string(), AttrValue::Int(1))]),
        );

        assert_eq!(shadow.device_ids(), vec![ieee(2), ieee(9)]);
        assert_eq!(shadow.device_count(), 2);
    }
}
