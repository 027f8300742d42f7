//! Routing of live updates to shadows: LYT status documents by address, and
//! per-entity state topics by exact topic.

use std::collections::HashMap;

use serde_json::Value;

use crate::codec::RawMessage;
use crate::directory::ShadowDirectory;
use crate::discovery::unique_id_of;
use crate::template::TemplateEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Shadows that took something from the document.
    Applied(Vec<String>),
    /// Resolved, but nothing in the document concerned those shadows.
    Ignored(Vec<String>),
    Unresolved,
    NoAddress,
}

/// Offer a status document to every shadow its `address` resolves to.
pub fn route_status(directory: &mut ShadowDirectory, doc: &Value) -> Routed {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => {
            tracing::debug!("Status: not an object: {}", doc);
            return Routed::NoAddress;
        }
    };
    let address = match obj.get("address").filter(|a| !a.is_null()) {
        Some(a) => a,
        None => {
            tracing::debug!("Status: no address, dropped");
            return Routed::NoAddress;
        }
    };

    let unique = unique_id_of(obj);
    let candidates = directory.resolve(address, unique.as_deref());
    if candidates.is_empty() {
        tracing::debug!("Status: no shadow for address {}", address);
        return Routed::Unresolved;
    }

    let mut applied = Vec::new();
    for id in &candidates {
        if let Some(shadow) = directory.get_mut(id) {
            if shadow.apply_status(doc) {
                applied.push(id.clone());
            }
        }
    }
    if applied.is_empty() {
        Routed::Ignored(candidates)
    } else {
        Routed::Applied(applied)
    }
}

/// Exact state topic → ids of shadows listening on it.
#[derive(Debug, Default)]
pub struct TopicIndex {
    by_topic: HashMap<String, Vec<String>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the topic is new and needs a subscription.
    pub fn add(&mut self, topic: &str, id: &str) -> bool {
        let ids = self.by_topic.entry(topic.to_string()).or_default();
        let fresh = ids.is_empty();
        if !ids.iter().any(|i| i == id) {
            ids.push(id.to_string());
        }
        fresh
    }

    pub fn ids(&self, topic: &str) -> &[String] {
        self.by_topic.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.keys().map(String::as_str)
    }

    /// Hand a state-topic message to every interested shadow. Returns ids
    /// whose state changed.
    pub fn route(
        &self,
        directory: &mut ShadowDirectory,
        topic: &str,
        msg: &RawMessage,
        templates: &dyn TemplateEngine,
    ) -> Vec<String> {
        let mut updated = Vec::new();
        for id in self.ids(topic) {
            if let Some(shadow) = directory.get_mut(id) {
                if shadow.apply_topic(topic, msg, templates) {
                    updated.push(id.clone());
                }
            }
        }
        updated
    }
}
