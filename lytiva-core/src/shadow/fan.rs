//! Five-speed fans.

use serde_json::{json, Value};

use super::{as_int, DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{CommandEnvelope, OutboundCommand, RawMessage};
use crate::discovery::{DeviceAddress, DiscoveryPayload};
use crate::error::CommandError;
use crate::template::TemplateEngine;

pub const SPEED_COUNT: i64 = 5;
/// Speed used for a bare `turn_on` when no `payload_on` is configured.
pub const DEFAULT_ON_SPEED: i64 = 3;

pub fn speed_to_percentage(speed: i64) -> u8 {
    (speed.saturating_mul(20)).clamp(0, 100) as u8
}

/// Nearest speed. Exact halves (10, 30, 50, 70, 90) round up to the next
/// speed rather than to the even one, so 50 is speed 3, not 2.
pub fn percentage_to_speed(percentage: i64) -> i64 {
    ((percentage + 10) / 20).clamp(0, SPEED_COUNT)
}

pub struct FanShadow {
    ident: Identity,
    command_topic: Option<String>,
    state_topic: Option<String>,
    payload_on: Option<String>,
    payload_off: Option<String>,
    percentage: Option<u8>,
}

impl FanShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        Some(Self {
            ident: Identity::from_payload(payload, "Lytiva Fan")?,
            command_topic: payload.string("command_topic"),
            state_topic: payload.string("state_topic"),
            payload_on: payload.string("payload_on"),
            payload_off: payload.string("payload_off"),
            percentage: None,
        })
    }

    pub fn percentage(&self) -> Option<u8> {
        self.percentage
    }

    /// Fan firmware only accepts integer addresses.
    fn wire_address(&self) -> Result<DeviceAddress, CommandError> {
        Ok(match self.ident.require_address()? {
            DeviceAddress::Text(s) => match s.trim().parse::<i64>() {
                Ok(i) => DeviceAddress::Int(i),
                Err(_) => DeviceAddress::Text(s),
            },
            native => native,
        })
    }

    fn speed_command(&self, topic: &str, speed: i64) -> Result<OutboundCommand, CommandError> {
        let envelope = CommandEnvelope::new(self.wire_address()?, "fan").with("fan_speed", speed);
        Ok(OutboundCommand::json(topic, envelope))
    }
}

impl DeviceShadow for FanShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Fan
    }

    fn apply_status(&mut self, status: &Value) -> bool {
        match status
            .get("fan")
            .and_then(|f| f.get("fan_speed"))
            .and_then(as_int)
        {
            Some(speed) => {
                self.percentage = Some(speed_to_percentage(speed));
                self.ident.available = true;
                true
            }
            None => false,
        }
    }

    fn state_topics(&self) -> Vec<String> {
        self.state_topic.iter().cloned().collect()
    }

    fn apply_topic(&mut self, topic: &str, msg: &RawMessage, _templates: &dyn TemplateEngine) -> bool {
        let doc = match &msg.json {
            Some(doc) => doc,
            None => {
                tracing::debug!("Fan {}: unparseable state on {}", self.ident.id, topic);
                return false;
            }
        };
        match doc.get("address") {
            Some(addr) if self.ident.matches_address(addr) => {
                self.ident.available = true;
                self.apply_status(doc);
                true
            }
            _ => false,
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        let topic = self
            .command_topic
            .as_deref()
            .ok_or(CommandError::MissingConfig("command_topic"))?;

        let command = match intent {
            Intent::TurnOn {
                percentage: Some(p),
                ..
            }
            | Intent::SetPercentage(p) => {
                self.speed_command(topic, percentage_to_speed(i64::from(*p)))?
            }
            Intent::TurnOn { .. } => match &self.payload_on {
                Some(raw) => OutboundCommand::raw(topic, raw.as_str()),
                None => self.speed_command(topic, DEFAULT_ON_SPEED)?,
            },
            Intent::TurnOff => match &self.payload_off {
                Some(raw) => OutboundCommand::raw(topic, raw.as_str()),
                None => self.speed_command(topic, 0)?,
            },
            other => return Err(other.unsupported(ShadowKind::Fan)),
        };
        Ok(vec![command])
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        attributes.insert("percentage".into(), json!(self.percentage));
        attributes.insert("speed_count".into(), json!(SPEED_COUNT));
        let state = match self.percentage {
            Some(0) => "off",
            Some(_) => "on",
            None => "unknown",
        };
        ShadowState {
            state: state.to_string(),
            attributes,
            available: self.ident.available,
        }
    }
}
