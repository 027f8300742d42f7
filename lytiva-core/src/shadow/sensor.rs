//! Read-only sensors.

use serde_json::{json, Value};

use super::{rendered_value, DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{OutboundCommand, RawMessage};
use crate::discovery::DiscoveryPayload;
use crate::error::CommandError;
use crate::template::TemplateEngine;

fn binary_icon(device_class: Option<&str>) -> &'static str {
    match device_class {
        Some("motion") => "mdi:motion-sensor",
        Some("occupancy") => "mdi:account-multiple",
        _ => "mdi:circle-outline",
    }
}

pub struct SensorShadow {
    ident: Identity,
    state_topic: Option<String>,
    value_template: Option<String>,
    unit: Option<String>,
    device_class: Option<String>,
    value: Option<String>,
}

impl SensorShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        Some(Self {
            ident: Identity::from_payload(payload, "Lytiva Sensor")?,
            state_topic: payload.string("state_topic"),
            value_template: payload.string("value_template"),
            unit: payload.string("unit_of_measurement"),
            device_class: payload.string("device_class"),
            value: None,
        })
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl DeviceShadow for SensorShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Sensor
    }

    fn state_topics(&self) -> Vec<String> {
        self.state_topic.iter().cloned().collect()
    }

    fn apply_topic(&mut self, _topic: &str, msg: &RawMessage, templates: &dyn TemplateEngine) -> bool {
        match rendered_value(self.value_template.as_deref(), msg, templates) {
            Some(value) => {
                self.value = Some(value);
                true
            }
            None => false,
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        Err(intent.unsupported(ShadowKind::Sensor))
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        if let Some(unit) = &self.unit {
            attributes.insert("unit_of_measurement".into(), json!(unit));
        }
        if let Some(class) = &self.device_class {
            attributes.insert("device_class".into(), json!(class));
        }
        ShadowState {
            state: self.value.clone().unwrap_or_else(|| "unknown".to_string()),
            attributes,
            available: self.ident.available,
        }
    }
}

pub struct BinarySensorShadow {
    ident: Identity,
    state_topic: Option<String>,
    value_template: Option<String>,
    payload_on: String,
    device_class: Option<String>,
    is_on: Option<bool>,
}

impl BinarySensorShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        Some(Self {
            ident: Identity::from_payload(payload, "Lytiva Binary Sensor")?,
            state_topic: payload.string("state_topic"),
            value_template: payload.string("value_template"),
            payload_on: payload.string_or("payload_on", "ON"),
            device_class: payload.string("device_class"),
            is_on: None,
        })
    }

    pub fn is_on(&self) -> Option<bool> {
        self.is_on
    }
}

impl DeviceShadow for BinarySensorShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::BinarySensor
    }

    fn state_topics(&self) -> Vec<String> {
        self.state_topic.iter().cloned().collect()
    }

    fn apply_topic(&mut self, _topic: &str, msg: &RawMessage, templates: &dyn TemplateEngine) -> bool {
        match rendered_value(self.value_template.as_deref(), msg, templates) {
            Some(value) => {
                self.is_on = Some(value == self.payload_on);
                true
            }
            None => false,
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        Err(intent.unsupported(ShadowKind::BinarySensor))
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        attributes.insert(
            "icon".into(),
            Value::from(binary_icon(self.device_class.as_deref())),
        );
        if let Some(class) = &self.device_class {
            attributes.insert("device_class".into(), json!(class));
        }
        let state = match self.is_on {
            Some(true) => "on",
            Some(false) => "off",
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
    use crate::template::{JinjaTemplates, PathTemplates};

    fn payload(v: Value) -> DiscoveryPayload {
        DiscoveryPayload::new(v.as_object().unwrap().clone())
    }

    #[test]
    fn test_sensor_value_and_attributes() {
        let mut s = SensorShadow::from_payload(&payload(json!({
            "unique_id": "t1",
            "state_topic": "lyt/t1",
            "value_template": "{{ value_json.temperature | round(1) }}",
            "unit_of_measurement": "°C",
            "device_class": "temperature"
        })))
        .unwrap();
        assert_eq!(s.state().state, "unknown");

        let msg = RawMessage::from_bytes(br#"{"temperature": 21.46}"#);
        assert!(s.apply_topic("lyt/t1", &msg, &JinjaTemplates::new()));
        assert_eq!(s.value(), Some("21.5"));

        let state = s.state();
        assert_eq!(state.attributes["unit_of_measurement"], json!("°C"));
        assert_eq!(state.attributes["device_class"], json!("temperature"));
    }

    #[test]
    fn test_sensor_template_failure_keeps_value() {
        let mut s = SensorShadow::from_payload(&payload(json!({
            "unique_id": "t1",
            "value_template": "{{ value_json.missing }}"
        })))
        .unwrap();
        let msg = RawMessage::from_bytes(br#"{"temperature": 1}"#);
        assert!(!s.apply_topic("x", &msg, &PathTemplates));
        assert_eq!(s.value(), None);
    }

    #[test]
    fn test_binary_sensor_payload_on() {
        let mut b = BinarySensorShadow::from_payload(&payload(json!({
            "unique_id": "m1",
            "device_class": "motion",
            "value_template": "{{ value_json.motion }}",
            "payload_on": "detected"
        })))
        .unwrap();
        let engine = PathTemplates;
        assert!(b.apply_topic("m", &RawMessage::from_bytes(br#"{"motion": "detected"}"#), &engine));
        assert_eq!(b.is_on(), Some(true));
        assert!(b.apply_topic("m", &RawMessage::from_bytes(br#"{"motion": "clear"}"#), &engine));
        assert_eq!(b.is_on(), Some(false));
        assert_eq!(b.state().attributes["icon"], json!("mdi:motion-sensor"));
    }

    #[test]
    fn test_sensors_reject_commands() {
        let mut s = SensorShadow::from_payload(&payload(json!({"unique_id": "t1"}))).unwrap();
        assert!(matches!(
            s.encode(&Intent::TurnOff, &PathTemplates),
            Err(CommandError::Unsupported { kind: "sensor", .. })
        ));
    }
}
