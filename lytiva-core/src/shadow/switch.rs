//! Relays and plain switches.

use serde_json::{json, Value};

use super::{as_bool, rendered_value, DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{CommandEnvelope, OutboundCommand, RawMessage};
use crate::discovery::DiscoveryPayload;
use crate::error::CommandError;
use crate::template::TemplateEngine;

pub struct SwitchShadow {
    ident: Identity,
    state_topic: Option<String>,
    command_topic: Option<String>,
    value_template: Option<String>,
    payload_on: Option<String>,
    payload_off: Option<String>,
    state_on: String,
    state_off: String,
    is_on: bool,
}

impl SwitchShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        Some(Self {
            ident: Identity::from_payload(payload, "Lytiva Switch")?,
            state_topic: payload.string("state_topic"),
            command_topic: payload.string("command_topic"),
            value_template: payload.string("value_template"),
            payload_on: payload.string("payload_on"),
            payload_off: payload.string("payload_off"),
            state_on: payload.string_or("state_on", "ON"),
            state_off: payload.string_or("state_off", "OFF"),
            is_on: false,
        })
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    fn command(&self, on: bool) -> Result<OutboundCommand, CommandError> {
        let topic = self
            .command_topic
            .as_deref()
            .ok_or(CommandError::MissingConfig("command_topic"))?;
        let raw = if on { &self.payload_on } else { &self.payload_off };
        Ok(match raw {
            Some(raw) => OutboundCommand::raw(topic, raw.as_str()),
            None => OutboundCommand::json(
                topic,
                CommandEnvelope::new(self.ident.require_address()?, "switch").with("power", on),
            ),
        })
    }
}

impl DeviceShadow for SwitchShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Switch
    }

    fn apply_status(&mut self, status: &Value) -> bool {
        match status
            .get("switch")
            .and_then(|s| s.get("power"))
            .and_then(as_bool)
        {
            Some(on) => {
                self.is_on = on;
                true
            }
            None => false,
        }
    }

    fn state_topics(&self) -> Vec<String> {
        self.state_topic.iter().cloned().collect()
    }

    fn apply_topic(&mut self, _topic: &str, msg: &RawMessage, templates: &dyn TemplateEngine) -> bool {
        let value = rendered_value(self.value_template.as_deref(), msg, templates)
            .unwrap_or_else(|| msg.text.trim().to_string());
        if value == self.state_on {
            self.is_on = true;
            true
        } else if value == self.state_off {
            self.is_on = false;
            true
        } else {
            tracing::debug!("Switch {}: unrecognised state {:?}", self.ident.id, value);
            false
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        let on = match intent {
            Intent::TurnOn { .. } => true,
            Intent::TurnOff => false,
            other => return Err(other.unsupported(ShadowKind::Switch)),
        };
        let command = self.command(on)?;
        self.is_on = on;
        Ok(vec![command])
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        attributes.insert("icon".into(), json!("mdi:toggle-switch"));
        ShadowState {
            state: if self.is_on { "on" } else { "off" }.to_string(),
            attributes,
            available: self.ident.available,
        }
    }
}
