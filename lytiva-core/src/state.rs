use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::shadow::ShadowState;

/// Host-visible state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    pub attributes: Map<String, Value>,
    pub available: bool,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

/// Where the engine writes shadow state. Called from the engine task only.
pub trait EntitySink: Send + Sync {
    /// A shadow was materialized.
    fn register(&self, entity_id: &str, state: &ShadowState);

    /// A shadow's state may have changed.
    fn update(&self, entity_id: &str, state: &ShadowState);
}

/// In-memory entity registry with change broadcast.
pub struct EntityRegistry {
    states: DashMap<String, EntityState>,
    event_tx: broadcast::Sender<StateChangedEvent>,
}

impl EntityRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: DashMap::new(),
            event_tx,
        }
    }

    pub fn get_all(&self) -> Vec<EntityState> {
        self.states
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Store a state and fire a change event. `last_changed` only moves
    /// when the state string changes, `last_updated` when anything does.
    pub fn set(&self, entity_id: &str, state: &ShadowState) -> EntityState {
        let now = Utc::now();
        let old_state = self.get(entity_id);

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state.state { now } else { prev.last_changed };
                let updated = if prev.state != state.state
                    || prev.attributes != state.attributes
                    || prev.available != state.available
                {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.to_string(),
            state: state.state.clone(),
            attributes: state.attributes.clone(),
            available: state.available,
            last_changed,
            last_updated,
        };

        if old_state.as_ref() == Some(&new_state) {
            return new_state;
        }

        self.states.insert(entity_id.to_string(), new_state.clone());

        // no subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: new_state.clone(),
        });

        new_state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl EntitySink for EntityRegistry {
    fn register(&self, entity_id: &str, state: &ShadowState) {
        tracing::info!("Registered entity {}", entity_id);
        self.set(entity_id, state);
    }

    fn update(&self, entity_id: &str, state: &ShadowState) {
        self.set(entity_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shadow_state(state: &str, brightness: u8) -> ShadowState {
        let mut attributes = Map::new();
        attributes.insert("brightness".into(), json!(brightness));
        ShadowState {
            state: state.to_string(),
            attributes,
            available: true,
        }
    }

    #[test]
    fn test_set_and_get() {
        let registry = EntityRegistry::new(16);
        registry.register("light.42", &shadow_state("on", 127));

        let s = registry.get("light.42").unwrap();
        assert_eq!(s.state, "on");
        assert_eq!(s.attributes["brightness"], json!(127));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_last_changed_only_on_state_change() {
        let registry = EntityRegistry::new(16);
        let first = registry.set("light.1", &shadow_state("on", 10));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = registry.set("light.1", &shadow_state("on", 20));

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated > first.last_updated);
    }

    #[tokio::test]
    async fn test_change_events_broadcast() {
        let registry = EntityRegistry::new(16);
        let mut rx = registry.subscribe();

        registry.update("fan.9", &shadow_state("on", 1));
        // identical state: no event
        registry.update("fan.9", &shadow_state("on", 1));
        registry.update("fan.9", &shadow_state("off", 1));

        let first = rx.recv().await.unwrap();
        assert!(first.old_state.is_none());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.old_state.unwrap().state, "on");
        assert_eq!(second.new_state.state, "off");
        assert!(rx.try_recv().is_err());
    }
}
