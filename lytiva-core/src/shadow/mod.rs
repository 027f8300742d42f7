//! Device shadows.
//!
//! One shadow per materialized device, holding last-known state. Decoding is
//! overwrite-on-presence: a status document only touches the fields it
//! carries, so applying the same document twice yields the same state.
//! Encoding turns a host [`Intent`] into wire commands and may update state
//! optimistically where the device never echoes it back.

pub mod climate;
pub mod cover;
pub mod fan;
pub mod light;
pub mod scene;
pub mod sensor;
pub mod switch;

use serde_json::{Map, Value};

use crate::codec::{OutboundCommand, RawMessage};
use crate::discovery::{DeviceAddress, DiscoveryPayload};
use crate::error::CommandError;
use crate::template::TemplateEngine;

pub use climate::{ClimateShadow, HvacMode};
pub use cover::CoverShadow;
pub use fan::FanShadow;
pub use light::{LightShadow, LightType};
pub use scene::SceneShadow;
pub use sensor::{BinarySensorShadow, SensorShadow};
pub use switch::SwitchShadow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowKind {
    Light,
    Cover,
    Fan,
    Climate,
    Switch,
    BinarySensor,
    Sensor,
    Scene,
}

impl ShadowKind {
    /// Discovery component name → kind.
    pub fn from_component(component: &str) -> Option<Self> {
        match component {
            "light" => Some(ShadowKind::Light),
            "cover" => Some(ShadowKind::Cover),
            "fan" => Some(ShadowKind::Fan),
            "climate" => Some(ShadowKind::Climate),
            "switch" => Some(ShadowKind::Switch),
            "binary_sensor" => Some(ShadowKind::BinarySensor),
            "sensor" => Some(ShadowKind::Sensor),
            "scene" => Some(ShadowKind::Scene),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShadowKind::Light => "light",
            ShadowKind::Cover => "cover",
            ShadowKind::Fan => "fan",
            ShadowKind::Climate => "climate",
            ShadowKind::Switch => "switch",
            ShadowKind::BinarySensor => "binary_sensor",
            ShadowKind::Sensor => "sensor",
            ShadowKind::Scene => "scene",
        }
    }
}

/// What the host asks a device to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    TurnOn {
        brightness: Option<u8>,
        color_temp: Option<u16>,
        rgb: Option<[u8; 3]>,
        percentage: Option<u8>,
    },
    TurnOff,
    SetPercentage(u8),
    OpenCover,
    CloseCover,
    StopCover,
    SetCoverPosition(u8),
    SetHvacMode(HvacMode),
    SetTemperature(f64),
    SetFanMode(String),
    SetPresetMode(String),
    Activate,
}

impl Intent {
    /// Plain `turn_on` with no arguments.
    pub fn turn_on() -> Self {
        Intent::TurnOn {
            brightness: None,
            color_temp: None,
            rgb: None,
            percentage: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Intent::TurnOn { .. } => "turn_on",
            Intent::TurnOff => "turn_off",
            Intent::SetPercentage(_) => "set_percentage",
            Intent::OpenCover => "open_cover",
            Intent::CloseCover => "close_cover",
            Intent::StopCover => "stop_cover",
            Intent::SetCoverPosition(_) => "set_cover_position",
            Intent::SetHvacMode(_) => "set_hvac_mode",
            Intent::SetTemperature(_) => "set_temperature",
            Intent::SetFanMode(_) => "set_fan_mode",
            Intent::SetPresetMode(_) => "set_preset_mode",
            Intent::Activate => "activate",
        }
    }

    pub(crate) fn unsupported(&self, kind: ShadowKind) -> CommandError {
        CommandError::Unsupported {
            kind: kind.as_str(),
            intent: self.name().to_string(),
        }
    }
}

/// Host-facing view of a shadow.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowState {
    pub state: String,
    pub attributes: Map<String, Value>,
    pub available: bool,
}

/// Id, display name and wire address shared by every kind.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub address: Option<DeviceAddress>,
    pub available: bool,
}

impl Identity {
    /// `None` if the payload has neither a unique id nor an address.
    pub fn from_payload(payload: &DiscoveryPayload, default_name: &str) -> Option<Self> {
        Some(Self {
            id: payload.canonical_id()?,
            name: payload.name_or(default_name),
            address: payload.address_or_id(),
            available: true,
        })
    }

    /// Whether an inbound address refers to this device (native or stringified).
    pub fn matches_address(&self, address: &Value) -> bool {
        match (&self.address, DeviceAddress::from_value(address)) {
            (Some(own), Some(other)) => *own == other || own.to_string() == other.to_string(),
            _ => false,
        }
    }

    pub(crate) fn require_address(&self) -> Result<DeviceAddress, CommandError> {
        self.address.clone().ok_or(CommandError::MissingConfig("address"))
    }

    fn base_attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("friendly_name".to_string(), Value::String(self.name.clone()));
        if let Some(addr) = &self.address {
            attrs.insert("address".to_string(), Value::String(addr.to_string()));
        }
        attrs
    }
}

/// A live device, decoded from status and encoded into commands.
pub trait DeviceShadow: Send {
    fn identity(&self) -> &Identity;

    fn kind(&self) -> ShadowKind;

    /// Apply a LYT status document. Returns whether anything was applied.
    ///
    /// The whole document is passed; each kind picks out its own sub-object.
    fn apply_status(&mut self, _status: &Value) -> bool {
        false
    }

    /// Per-device topics this shadow wants messages from.
    fn state_topics(&self) -> Vec<String> {
        Vec::new()
    }

    /// Apply a message from one of [`DeviceShadow::state_topics`].
    fn apply_topic(&mut self, _topic: &str, _msg: &RawMessage, _templates: &dyn TemplateEngine) -> bool {
        false
    }

    /// Translate an intent into commands to publish.
    fn encode(
        &mut self,
        intent: &Intent,
        templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError>;

    fn state(&self) -> ShadowState;

    fn id(&self) -> &str {
        &self.identity().id
    }

    fn address(&self) -> Option<&DeviceAddress> {
        self.identity().address.as_ref()
    }

    /// `<kind>.<canonical id>`
    fn entity_id(&self) -> String {
        format!("{}.{}", self.kind().as_str(), self.id())
    }
}

/// Construct the shadow for `kind`, or `None` if the payload can't back one.
pub fn build(kind: ShadowKind, payload: &DiscoveryPayload) -> Option<Box<dyn DeviceShadow>> {
    let shadow: Box<dyn DeviceShadow> = match kind {
        ShadowKind::Light => Box::new(LightShadow::from_payload(payload)?),
        ShadowKind::Cover => Box::new(CoverShadow::from_payload(payload)?),
        ShadowKind::Fan => Box::new(FanShadow::from_payload(payload)?),
        ShadowKind::Climate => Box::new(ClimateShadow::from_payload(payload)?),
        ShadowKind::Switch => Box::new(SwitchShadow::from_payload(payload)?),
        ShadowKind::BinarySensor => Box::new(BinarySensorShadow::from_payload(payload)?),
        ShadowKind::Sensor => Box::new(SensorShadow::from_payload(payload)?),
        ShadowKind::Scene => Box::new(SceneShadow::from_payload(payload)?),
    };
    Some(shadow)
}

/// Integer from a JSON number or numeric string; floats truncate.
pub(crate) fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

pub(crate) fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Booleans as sent by nodes: `true`, `1`, `"ON"`, ...
pub(crate) fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// A JSON scalar as plain text (strings unquoted).
pub(crate) fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `value_template` output, or the trimmed raw payload when there is none.
pub(crate) fn rendered_value(
    template: Option<&str>,
    msg: &RawMessage,
    templates: &dyn TemplateEngine,
) -> Option<String> {
    match template {
        Some(source) => crate::template::render_value(templates, source, msg),
        None => Some(msg.text.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> DiscoveryPayload {
        DiscoveryPayload::new(v.as_object().unwrap().clone())
    }

    #[test]
    fn test_identity_address_matching() {
        let ident = Identity::from_payload(&payload(json!({"unique_id": "42"})), "x").unwrap();
        assert!(ident.matches_address(&json!(42)));
        assert!(ident.matches_address(&json!("42")));
        assert!(!ident.matches_address(&json!(43)));
        assert!(!ident.matches_address(&Value::Null));
    }

    #[test]
    fn test_build_respects_kind() {
        let p = payload(json!({"unique_id": "1", "command_topic": "c"}));
        let shadow = build(ShadowKind::Light, &p).unwrap();
        assert_eq!(shadow.kind(), ShadowKind::Light);
        assert_eq!(shadow.entity_id(), "light.1");

        assert!(build(ShadowKind::Light, &payload(json!({"name": "no id"}))).is_none());
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(as_int(&json!(50)), Some(50));
        assert_eq!(as_int(&json!(50.9)), Some(50));
        assert_eq!(as_int(&json!("70")), Some(70));
        assert_eq!(as_int(&json!(true)), None);
        assert_eq!(as_bool(&json!("ON")), Some(true));
        assert_eq!(as_bool(&json!(0)), Some(false));
        assert_eq!(as_bool(&json!("maybe")), None);
        assert_eq!(as_float(&json!("23.5")), Some(23.5));
    }

    #[test]
    fn test_component_names_round_trip() {
        for name in ["light", "cover", "fan", "climate", "switch", "binary_sensor", "sensor", "scene"] {
            assert_eq!(ShadowKind::from_component(name).unwrap().as_str(), name);
        }
        assert_eq!(ShadowKind::from_component("vacuum"), None);
    }
}
