//! Shadow directory: every materialized shadow, indexed by canonical id and
//! by wire address.
//!
//! Owned by the engine task; nothing else mutates it.

use std::collections::HashMap;

use serde_json::Value;

use crate::discovery::DeviceAddress;
use crate::shadow::DeviceShadow;

#[derive(Default)]
pub struct ShadowDirectory {
    by_id: HashMap<String, Box<dyn DeviceShadow>>,
    /// Several entities of one node share its address.
    by_address: HashMap<DeviceAddress, Vec<String>>,
}

impl ShadowDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a shadow. Returns `false` (and drops it) if the id is taken.
    pub fn insert(&mut self, shadow: Box<dyn DeviceShadow>) -> bool {
        let id = shadow.id().to_string();
        if self.by_id.contains_key(&id) {
            return false;
        }
        if let Some(addr) = shadow.address() {
            let ids = self.by_address.entry(addr.clone()).or_default();
            if !ids.is_empty() {
                tracing::debug!("Address {} shared by {:?} and {}", addr, ids, id);
            }
            ids.push(id.clone());
        }
        self.by_id.insert(id, shadow);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&(dyn DeviceShadow + 'static)> {
        self.by_id.get(id).map(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut (dyn DeviceShadow + 'static)> {
        self.by_id.get_mut(id).map(|s| s.as_mut())
    }

    /// Ids indexed under exactly this address, in insertion order.
    pub fn ids_for_address(&self, address: &DeviceAddress) -> &[String] {
        self.by_address
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find the shadows a status message may be for. The first step with
    /// any hit wins and all of its candidates are returned.
    ///
    /// 1. address index, native type
    /// 2. address index, stringified
    /// 3. id index, by the message's unique id
    /// 4. scan comparing stringified address and unique id against every
    ///    shadow's address and id
    pub fn resolve(&self, address: &Value, unique_id: Option<&str>) -> Vec<String> {
        let addr = DeviceAddress::from_value(address);

        if let Some(addr) = &addr {
            let native = self.ids_for_address(addr);
            if !native.is_empty() {
                return native.to_vec();
            }
            let stringified = self.ids_for_address(&addr.stringified());
            if !stringified.is_empty() {
                return stringified.to_vec();
            }
        }

        if let Some(uid) = unique_id {
            if self.by_id.contains_key(uid) {
                return vec![uid.to_string()];
            }
        }

        let wanted_addr = addr.map(|a| a.to_string());
        let mut found: Vec<String> = self
            .by_id
            .iter()
            .filter(|(id, shadow)| {
                let own_addr = shadow.address().map(|a| a.to_string());
                let addr_hit = wanted_addr
                    .as_ref()
                    .is_some_and(|w| own_addr.as_ref() == Some(w) || *id == w);
                let uid_hit =
                    unique_id.is_some_and(|u| id.as_str() == u || own_addr.as_deref() == Some(u));
                addr_hit || uid_hit
            })
            .map(|(id, _)| id.clone())
            .collect();
        found.sort();
        found
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn DeviceShadow + 'static)> {
        self.by_id.values().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryPayload;
    use crate::shadow::{self, ShadowKind};
    use serde_json::json;

    fn light(v: Value) -> Box<dyn DeviceShadow> {
        let payload = DiscoveryPayload::new(v.as_object().unwrap().clone());
        shadow::build(ShadowKind::Light, &payload).unwrap()
    }

    #[test]
    fn test_insert_indexes_both_ways() {
        let mut dir = ShadowDirectory::new();
        assert!(dir.insert(light(json!({"unique_id": "42", "name": "Lamp"}))));
        assert!(dir.contains("42"));
        assert_eq!(dir.ids_for_address(&DeviceAddress::Text("42".into())), ["42"]);

        assert!(!dir.insert(light(json!({"unique_id": "42", "name": "Again"}))));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("42").unwrap().identity().name, "Lamp");
    }

    #[test]
    fn test_resolve_native_then_stringified() {
        let mut dir = ShadowDirectory::new();
        dir.insert(light(json!({"unique_id": "a", "address": 60590})));
        dir.insert(light(json!({"unique_id": "42"})));

        // step 1: Int index entry
        assert_eq!(dir.resolve(&json!(60590), None), ["a"]);
        // step 2: Int status, Text index entry
        assert_eq!(dir.resolve(&json!(42), None), ["42"]);
    }

    #[test]
    fn test_resolve_by_unique_id() {
        let mut dir = ShadowDirectory::new();
        dir.insert(light(json!({"unique_id": "kitchen", "address": 7})));
        assert_eq!(dir.resolve(&json!(999), Some("kitchen")), ["kitchen"]);
    }

    #[test]
    fn test_resolve_falls_back_to_scan() {
        let mut dir = ShadowDirectory::new();
        dir.insert(light(json!({"unique_id": "k", "address": 7})));
        // Text "7" misses both index lookups; the scan compares strings
        assert_eq!(dir.resolve(&json!("7"), None), ["k"]);
    }

    #[test]
    fn test_resolve_miss() {
        let mut dir = ShadowDirectory::new();
        dir.insert(light(json!({"unique_id": "k", "address": 7})));
        assert!(dir.resolve(&json!(8), None).is_empty());
        assert!(dir.resolve(&Value::Null, None).is_empty());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_shared_address_keeps_every_shadow() {
        let mut dir = ShadowDirectory::new();
        dir.insert(light(json!({"unique_id": "L1", "address": 42})));
        let payload = DiscoveryPayload::new(
            json!({"unique_id": "pir1", "address": 42})
                .as_object()
                .unwrap()
                .clone(),
        );
        dir.insert(shadow::build(ShadowKind::BinarySensor, &payload).unwrap());

        assert_eq!(dir.ids_for_address(&DeviceAddress::Int(42)), ["L1", "pir1"]);
        assert_eq!(dir.resolve(&json!(42), None), ["L1", "pir1"]);
        assert_eq!(dir.resolve(&json!("42"), None), ["L1", "pir1"]);
    }
}
