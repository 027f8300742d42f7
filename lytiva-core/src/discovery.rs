//! Discovery registry.
//!
//! Consumes `<prefix>/<component>/<node>/config` messages, deduplicates them
//! by canonical device id and keeps the first payload seen for each id.
//! Re-delivery of a known id does not overwrite the stored payload, but is
//! still handed on for dispatch so late platform setup sees it; the platform
//! add-functions are what keep that idempotent.
//!
//! There is no removal protocol: an empty or non-JSON payload is dropped like
//! any other undecodable message.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec;

/// Keys that may carry the device's unique id, in lookup order.
pub const UNIQUE_ID_KEYS: [&str; 3] = ["unique_id", "uniqueId", "uniqueid"];

/// A device address as it appeared on the wire.
///
/// Nodes report addresses as integers or numeric strings depending on
/// firmware; the native form is kept so index lookups can try it before the
/// stringified form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum DeviceAddress {
    Int(i64),
    Text(String),
}

impl DeviceAddress {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => DeviceAddress::Int(i),
                None => DeviceAddress::Text(n.to_string()),
            }),
            Value::String(s) => Some(DeviceAddress::Text(s.clone())),
            other => Some(DeviceAddress::Text(other.to_string())),
        }
    }

    /// The stringified form, used for the second lookup and the fallback scan.
    pub fn stringified(&self) -> DeviceAddress {
        DeviceAddress::Text(self.to_string())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Int(i) => write!(f, "{}", i),
            DeviceAddress::Text(s) => f.write_str(s),
        }
    }
}

/// First present unique-id key of a document, coerced to a string.
pub fn unique_id_of(doc: &Map<String, Value>) -> Option<String> {
    UNIQUE_ID_KEYS
        .iter()
        .filter_map(|k| doc.get(*k))
        .find(|v| !v.is_null())
        .map(value_to_id)
}

fn value_to_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A discovery document, immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryPayload(Map<String, Value>);

impl DiscoveryPayload {
    pub fn new(doc: Map<String, Value>) -> Self {
        Self(doc)
    }

    /// `unique_id` (or a vendor-cased variant), else `address`, as a string.
    pub fn canonical_id(&self) -> Option<String> {
        unique_id_of(&self.0).or_else(|| {
            self.0
                .get("address")
                .filter(|v| !v.is_null())
                .map(value_to_id)
        })
    }

    /// The `address` field in its native type.
    pub fn address(&self) -> Option<DeviceAddress> {
        self.0.get("address").and_then(DeviceAddress::from_value)
    }

    /// `address`, falling back to the unique id for nodes that only send one.
    pub fn address_or_id(&self) -> Option<DeviceAddress> {
        self.address()
            .or_else(|| unique_id_of(&self.0).map(DeviceAddress::Text))
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.str(key).map(str::to_string)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or(default).to_string()
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.0.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn strings(&self, key: &str) -> Option<Vec<String>> {
        self.0.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }

    pub fn name_or(&self, default: &str) -> String {
        self.string_or("name", default)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// A discovery message accepted by the registry, ready for dispatch.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub id: String,
    /// Second topic segment, e.g. `light` in `homeassistant/light/42/config`.
    pub component: String,
    pub payload: Arc<DiscoveryPayload>,
}

/// Stored discovery payloads keyed by canonical id, with the component they
/// were first announced under.
pub struct DiscoveryRegistry {
    prefix: String,
    payloads: DashMap<String, Discovered>,
}

impl DiscoveryRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            payloads: DashMap::new(),
        }
    }

    /// `<prefix>/<component>/<node>/config` → component.
    pub fn component_of<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 3 || parts[0] != self.prefix || parts.last() != Some(&"config") {
            return None;
        }
        Some(parts[1])
    }

    /// Handle one discovery message. Returns what should be dispatched.
    pub fn on_discovery_message(&self, topic: &str, payload: &[u8]) -> Option<Discovered> {
        let component = match self.component_of(topic) {
            Some(c) => c,
            None => {
                tracing::debug!("Discovery: ignoring non-config topic {}", topic);
                return None;
            }
        };

        let doc = match codec::decode_object(payload) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!("Discovery: dropping payload on {}: {}", topic, e);
                return None;
            }
        };

        let candidate = DiscoveryPayload::new(doc);
        let id = match candidate.canonical_id() {
            Some(id) => id,
            None => {
                tracing::debug!("Discovery: payload on {} has no unique_id or address", topic);
                return None;
            }
        };

        let stored = self
            .payloads
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!("Discovery: stored payload for {} ({})", id, component);
                Discovered {
                    id: id.clone(),
                    component: component.to_string(),
                    payload: Arc::new(candidate),
                }
            })
            .clone();

        Some(stored)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DiscoveryPayload>> {
        self.payloads.get(id).map(|e| e.value().payload.clone())
    }

    /// Snapshot of every stored entry.
    pub fn entries(&self) -> Vec<Discovered> {
        self.payloads.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
