//! Controller scenes. Activation publishes the configured payload; the state
//! topic only serves as a liveness signal.

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde_json::json;

use super::{DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{OutboundCommand, RawMessage};
use crate::discovery::{unique_id_of, DiscoveryPayload};
use crate::error::CommandError;
use crate::template::TemplateEngine;

pub struct SceneShadow {
    ident: Identity,
    command_topic: String,
    state_topic: Option<String>,
    payload_on: String,
    area: Option<String>,
    last_activated: Option<DateTime<Utc>>,
}

impl SceneShadow {
    /// Scenes need a name, unique id, command topic and payload.
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        let name = payload.string("name")?;
        unique_id_of(payload.as_map())?;
        let command_topic = payload.string("command_topic")?;
        let payload_on = payload.string("payload_on")?;
        let mut ident = Identity::from_payload(payload, &name)?;
        ident.name = name;

        Some(Self {
            ident,
            command_topic,
            state_topic: payload.string("state_topic"),
            payload_on,
            area: payload.string("suggested_area"),
            last_activated: None,
        })
    }

    pub fn last_activated(&self) -> Option<DateTime<Utc>> {
        self.last_activated
    }
}

impl DeviceShadow for SceneShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Scene
    }

    fn state_topics(&self) -> Vec<String> {
        self.state_topic.iter().cloned().collect()
    }

    fn apply_topic(&mut self, topic: &str, msg: &RawMessage, _templates: &dyn TemplateEngine) -> bool {
        tracing::debug!("Scene {} state on {}: {}", self.ident.name, topic, msg.text);
        self.ident.available = true;
        true
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        match intent {
            Intent::Activate | Intent::TurnOn { .. } => {
                tracing::info!("Activating scene {}", self.ident.name);
                self.last_activated = Some(Utc::now());
                Ok(vec![OutboundCommand::raw(&self.command_topic, self.payload_on.as_str())
                    .with_qos(QoS::AtLeastOnce)])
            }
            other => Err(other.unsupported(ShadowKind::Scene)),
        }
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        if let Some(area) = &self.area {
            attributes.insert("suggested_area".into(), json!(area));
        }
        ShadowState {
            state: self
                .last_activated
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
            attributes,
            available: self.ident.available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutboundPayload;
    use crate::template::PathTemplates;
    use serde_json::Value;

    fn payload(v: Value) -> DiscoveryPayload {
        DiscoveryPayload::new(v.as_object().unwrap().clone())
    }

    #[test]
    fn test_requires_all_fields() {
        let full = json!({
            "name": "Evening",
            "unique_id": "sc1",
            "command_topic": "LYT/scene/set",
            "payload_on": "{\"scene\": 3}"
        });
        assert!(SceneShadow::from_payload(&payload(full.clone())).is_some());

        for key in ["name", "unique_id", "command_topic", "payload_on"] {
            let mut partial = full.clone();
            partial.as_object_mut().unwrap().remove(key);
            assert!(SceneShadow::from_payload(&payload(partial)).is_none(), "without {key}");
        }
    }

    #[test]
    fn test_activate_publishes_qos1_raw() {
        let mut s = SceneShadow::from_payload(&payload(json!({
            "name": "Evening",
            "unique_id": "sc1",
            "command_topic": "LYT/scene/set",
            "payload_on": "{\"scene\": 3}",
            "suggested_area": "Lounge"
        })))
        .unwrap();

        let cmds = s.encode(&Intent::Activate, &PathTemplates).unwrap();
        assert_eq!(cmds[0].topic, "LYT/scene/set");
        assert_eq!(cmds[0].qos, QoS::AtLeastOnce);
        assert!(matches!(&cmds[0].payload, OutboundPayload::Raw(t) if t == "{\"scene\": 3}"));
        assert!(s.last_activated().is_some());
        assert_eq!(s.state().attributes["suggested_area"], json!("Lounge"));
        assert_eq!(s.entity_id(), "scene.sc1");
    }

    #[test]
    fn test_state_topic_marks_available() {
        let mut s = SceneShadow::from_payload(&payload(json!({
            "name": "Evening",
            "unique_id": "sc1",
            "command_topic": "c",
            "state_topic": "s",
            "payload_on": "1"
        })))
        .unwrap();
        s.ident.available = false;
        assert!(s.apply_topic("s", &RawMessage::from_bytes(b"anything"), &PathTemplates));
        assert!(s.state().available);
    }
}
