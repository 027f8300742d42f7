//! Curtains.
//!
//! Position comes from `curtain.curtain_level` (or a top-level
//! `curtain_level`) and is only ever set by the device; commands are not
//! applied optimistically.

use serde_json::{json, Value};

use super::{as_int, DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{OutboundCommand, RawMessage};
use crate::discovery::DiscoveryPayload;
use crate::error::CommandError;
use crate::template::TemplateEngine;

/// Placeholder substituted literally in `set_position_template`.
pub const POSITION_PLACEHOLDER: &str = "{{ position }}";

pub struct CoverShadow {
    ident: Identity,
    command_topic: Option<String>,
    state_topic: Option<String>,
    position_topic: Option<String>,
    set_position_topic: Option<String>,
    set_position_template: Option<String>,
    payload_open: Option<String>,
    payload_close: Option<String>,
    payload_stop: Option<String>,
    position: Option<u8>,
}

impl CoverShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        let ident = Identity::from_payload(payload, "Lytiva Curtain")?;
        let command_topic = payload.string("command_topic");
        let state_topic = payload.string("state_topic");
        Some(Self {
            ident,
            position_topic: payload.string("position_topic").or_else(|| state_topic.clone()),
            set_position_topic: payload
                .string("set_position_topic")
                .or_else(|| command_topic.clone()),
            set_position_template: payload.string("set_position_template"),
            payload_open: payload.string("payload_open"),
            payload_close: payload.string("payload_close"),
            payload_stop: payload.string("payload_stop"),
            command_topic,
            state_topic,
            position: None,
        })
    }

    pub fn position(&self) -> Option<u8> {
        self.position
    }

    /// `None` until the first position report.
    pub fn is_closed(&self) -> Option<bool> {
        self.position.map(|p| p == 0)
    }

    fn raw_command(
        &self,
        payload: &Option<String>,
        name: &'static str,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        let topic = self
            .command_topic
            .as_deref()
            .ok_or(CommandError::MissingConfig("command_topic"))?;
        let payload = payload.as_deref().ok_or(CommandError::MissingConfig(name))?;
        Ok(vec![OutboundCommand::raw(topic, payload)])
    }
}

impl DeviceShadow for CoverShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Cover
    }

    fn apply_status(&mut self, status: &Value) -> bool {
        let level = status
            .get("curtain")
            .and_then(|c| c.get("curtain_level"))
            .or_else(|| status.get("curtain_level"))
            .and_then(as_int);

        match level {
            Some(level) => {
                let level = level.clamp(0, 100) as u8;
                if self.position != Some(level) {
                    tracing::info!("Curtain {} position now {}", self.ident.id, level);
                }
                self.position = Some(level);
                self.ident.available = true;
                true
            }
            None => false,
        }
    }

    fn state_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state_topic.iter().cloned().collect();
        if let Some(pos) = &self.position_topic {
            if !topics.contains(pos) {
                topics.push(pos.clone());
            }
        }
        topics
    }

    fn apply_topic(&mut self, topic: &str, msg: &RawMessage, _templates: &dyn TemplateEngine) -> bool {
        let doc = match &msg.json {
            Some(doc) => doc,
            None => {
                tracing::debug!("Curtain {}: non-JSON message on {}", self.ident.id, topic);
                return false;
            }
        };
        match doc.get("address") {
            Some(addr) if self.ident.matches_address(addr) => self.apply_status(doc),
            Some(_) => false,
            None => {
                tracing::debug!("Curtain {}: no address in message on {}", self.ident.id, topic);
                false
            }
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        match intent {
            Intent::OpenCover => self.raw_command(&self.payload_open, "payload_open"),
            Intent::CloseCover => self.raw_command(&self.payload_close, "payload_close"),
            Intent::StopCover => self.raw_command(&self.payload_stop, "payload_stop"),
            Intent::SetCoverPosition(position) => {
                let topic = self
                    .set_position_topic
                    .as_deref()
                    .ok_or(CommandError::MissingConfig("set_position_topic"))?;
                let template = self
                    .set_position_template
                    .as_deref()
                    .ok_or(CommandError::MissingConfig("set_position_template"))?;
                let position = (*position).min(100);
                let payload = template.replace(POSITION_PLACEHOLDER, &position.to_string());
                Ok(vec![OutboundCommand::raw(topic, payload)])
            }
            other => Err(other.unsupported(ShadowKind::Cover)),
        }
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        if let Some(p) = self.position {
            attributes.insert("current_position".into(), json!(p));
        }
        let state = match self.is_closed() {
            Some(true) => "closed",
            Some(false) => "open",
            None => "unknown",
        };
        ShadowState {
            state: state.to_string(),
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

    fn curtain() -> CoverShadow {
        let payload = json!({
            "unique_id": "c1",
            "address": 60590,
            "device_class": "curtain",
            "command_topic": "LYT/c1/cmd",
            "state_topic": "LYT/c1/state",
            "set_position_template": "{\"version\":\"v1.0\",\"address\":60590,\"type\":\"curtain\",\"curtain_level\":{{ position }}}",
            "payload_open": "OPEN",
            "payload_close": "CLOSE",
            "payload_stop": "STOP"
        });
        CoverShadow::from_payload(&DiscoveryPayload::new(payload.as_object().unwrap().clone())).unwrap()
    }

    fn raw(cmd: &OutboundCommand) -> &str {
        match &cmd.payload {
            OutboundPayload::Raw(text) => text,
            OutboundPayload::Json(_) => panic!("expected raw payload"),
        }
    }

    #[test]
    fn test_set_position_substitutes_template() {
        let mut c = curtain();
        let cmds = c.encode(&Intent::SetCoverPosition(70), &PathTemplates).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].topic, "LYT/c1/cmd");
        assert_eq!(
            raw(&cmds[0]),
            "{\"version\":\"v1.0\",\"address\":60590,\"type\":\"curtain\",\"curtain_level\":70}"
        );
        // not optimistic
        assert_eq!(c.position(), None);
    }

    #[test]
    fn test_open_close_stop_are_raw() {
        let mut c = curtain();
        assert_eq!(raw(&c.encode(&Intent::OpenCover, &PathTemplates).unwrap()[0]), "OPEN");
        assert_eq!(raw(&c.encode(&Intent::CloseCover, &PathTemplates).unwrap()[0]), "CLOSE");
        assert_eq!(raw(&c.encode(&Intent::StopCover, &PathTemplates).unwrap()[0]), "STOP");
    }

    #[test]
    fn test_missing_payload_is_error() {
        let payload = json!({"unique_id": "c2", "command_topic": "x"});
        let mut c =
            CoverShadow::from_payload(&DiscoveryPayload::new(payload.as_object().unwrap().clone())).unwrap();
        assert!(matches!(
            c.encode(&Intent::OpenCover, &PathTemplates),
            Err(CommandError::MissingConfig("payload_open"))
        ));
        assert!(matches!(
            c.encode(&Intent::SetCoverPosition(10), &PathTemplates),
            Err(CommandError::MissingConfig("set_position_template"))
        ));
    }

    #[test]
    fn test_status_position_and_closed() {
        let mut c = curtain();
        assert_eq!(c.state().state, "unknown");
        assert!(c.apply_status(&json!({"address": 60590, "curtain": {"curtain_level": 40}})));
        assert_eq!(c.position(), Some(40));
        assert_eq!(c.state().state, "open");
        assert!(c.apply_status(&json!({"address": 60590, "curtain_level": 0})));
        assert_eq!(c.is_closed(), Some(true));
        assert!(!c.apply_status(&json!({"address": 60590, "dimmer": {"dimming": 3}})));
        assert_eq!(c.position(), Some(0));
    }

    #[test]
    fn test_state_topic_requires_matching_address() {
        let mut c = curtain();
        assert_eq!(c.state_topics(), vec!["LYT/c1/state".to_string()]);

        let other = RawMessage::from_bytes(br#"{"address": 1, "curtain_level": 55}"#);
        assert!(!c.apply_topic("LYT/c1/state", &other, &PathTemplates));

        let none = RawMessage::from_bytes(br#"{"curtain_level": 55}"#);
        assert!(!c.apply_topic("LYT/c1/state", &none, &PathTemplates));

        let ours = RawMessage::from_bytes(br#"{"address": "60590", "curtain_level": 55}"#);
        assert!(c.apply_topic("LYT/c1/state", &ours, &PathTemplates));
        assert_eq!(c.position(), Some(55));
    }
}
