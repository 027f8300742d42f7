//! Dimmer, CCT, RGB and on/off lights.
//!
//! Mappings truncate toward zero in both directions: dimming 50 decodes to
//! brightness 127, and brightness 128 encodes to dimming 50.

use serde_json::{json, Map, Value};

use super::{as_bool, as_int, DeviceShadow, Identity, Intent, ShadowKind, ShadowState};
use crate::codec::{CommandEnvelope, OutboundCommand};
use crate::discovery::DiscoveryPayload;
use crate::error::CommandError;
use crate::template::TemplateEngine;

pub const DEFAULT_MIN_MIREDS: u16 = 154;
pub const DEFAULT_MAX_MIREDS: u16 = 370;

/// Device dimming percent → host brightness.
pub fn dimming_to_brightness(dimming: i64) -> u8 {
    (dimming.clamp(0, 100) * 255 / 100) as u8
}

/// Host brightness → device dimming percent.
pub fn brightness_to_dimming(brightness: u8) -> i64 {
    i64::from(brightness) * 100 / 255
}

/// Mireds → device colour-temperature percent (100 is coolest).
pub fn mireds_to_device_pct(mireds: u16, min: u16, max: u16) -> i64 {
    if max <= min {
        return 0;
    }
    let (m, lo, hi) = (
        i64::from(mireds.clamp(min, max)),
        i64::from(min),
        i64::from(max),
    );
    100 - (m - lo) * 100 / (hi - lo)
}

/// Device colour-temperature percent → mireds.
pub fn device_pct_to_mireds(pct: i64, min: u16, max: u16) -> u16 {
    if max <= min {
        return min;
    }
    let span = i64::from(max - min);
    (i64::from(max) - pct.clamp(0, 100) * span / 100) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightType {
    Dimmer,
    Cct,
    Rgb,
    Switch,
}

impl LightType {
    pub fn detect(payload: &DiscoveryPayload) -> Self {
        let declared = payload.str("type").unwrap_or("dimmer");
        if payload.has("color_temp_command_topic") || declared == "cct" {
            LightType::Cct
        } else if declared == "rgb" || payload.has("rgb_command_topic") {
            LightType::Rgb
        } else if declared == "dimmer" {
            LightType::Dimmer
        } else {
            LightType::Switch
        }
    }

    /// Command `type` tag and status sub-object key.
    pub fn wire_tag(self) -> &'static str {
        match self {
            LightType::Dimmer => "dimmer",
            LightType::Cct => "cct",
            LightType::Rgb => "rgb",
            LightType::Switch => "switch",
        }
    }
}

pub struct LightShadow {
    ident: Identity,
    light_type: LightType,
    command_topic: Option<String>,
    min_mireds: u16,
    max_mireds: u16,
    is_on: bool,
    brightness: u8,
    color_temp: u16,
    rgb: [u8; 3],
}

impl LightShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        let ident = Identity::from_payload(payload, "Lytiva Light")?;
        let min_mireds = payload.i64_or("min_mireds", i64::from(DEFAULT_MIN_MIREDS));
        let max_mireds = payload.i64_or("max_mireds", i64::from(DEFAULT_MAX_MIREDS));
        let min_mireds = u16::try_from(min_mireds).unwrap_or(DEFAULT_MIN_MIREDS);
        let max_mireds = u16::try_from(max_mireds).unwrap_or(DEFAULT_MAX_MIREDS);

        Some(Self {
            ident,
            light_type: LightType::detect(payload),
            command_topic: payload.string("command_topic"),
            min_mireds,
            max_mireds,
            is_on: false,
            brightness: 255,
            color_temp: min_mireds,
            rgb: [255, 255, 255],
        })
    }

    pub fn light_type(&self) -> LightType {
        self.light_type
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    pub fn color_temp(&self) -> u16 {
        self.color_temp
    }

    pub fn rgb(&self) -> [u8; 3] {
        self.rgb
    }

    fn apply_dimming(&mut self, sub: &Map<String, Value>) -> bool {
        match sub.get("dimming").and_then(as_int) {
            Some(d) => {
                self.brightness = dimming_to_brightness(d);
                self.is_on = d > 0;
                true
            }
            None => false,
        }
    }

    fn envelope(&self) -> Result<CommandEnvelope, CommandError> {
        Ok(CommandEnvelope::new(
            self.ident.require_address()?,
            self.light_type.wire_tag(),
        ))
    }
}

impl DeviceShadow for LightShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Light
    }

    fn apply_status(&mut self, status: &Value) -> bool {
        if self.light_type == LightType::Switch {
            let power = status
                .get("switch")
                .and_then(|s| s.get("power"))
                .or_else(|| status.get("power"))
                .and_then(as_bool);
            return match power {
                Some(on) => {
                    self.is_on = on;
                    true
                }
                None => false,
            };
        }

        let sub = match status
            .get(self.light_type.wire_tag())
            .and_then(Value::as_object)
        {
            Some(sub) => sub,
            None => return false,
        };

        match self.light_type {
            LightType::Dimmer => self.apply_dimming(sub),
            LightType::Cct => {
                let dimmed = self.apply_dimming(sub);
                let tinted = match sub.get("color_temperature").and_then(as_int) {
                    Some(pct) => {
                        self.color_temp = device_pct_to_mireds(pct, self.min_mireds, self.max_mireds);
                        true
                    }
                    None => false,
                };
                dimmed || tinted
            }
            LightType::Rgb => {
                let mut applied = false;
                for (i, key) in ["r", "g", "b"].iter().enumerate() {
                    if let Some(c) = sub.get(*key).and_then(as_int) {
                        self.rgb[i] = c.clamp(0, 255) as u8;
                        applied = true;
                    }
                }
                if applied {
                    self.is_on = self.rgb.iter().any(|c| *c > 0);
                }
                applied
            }
            LightType::Switch => false,
        }
    }

    fn encode(
        &mut self,
        intent: &Intent,
        _templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        let topic = self
            .command_topic
            .clone()
            .ok_or(CommandError::MissingConfig("command_topic"))?;

        let envelope = match intent {
            Intent::TurnOn {
                brightness,
                color_temp,
                rgb,
                ..
            } => {
                let envelope = self.envelope()?;
                let envelope = match self.light_type {
                    LightType::Dimmer => {
                        let b = brightness.unwrap_or(255);
                        self.brightness = b;
                        envelope.with("dimming", brightness_to_dimming(b))
                    }
                    LightType::Cct => {
                        let b = brightness.unwrap_or(255);
                        let ct = color_temp.unwrap_or(self.color_temp);
                        self.brightness = b;
                        self.color_temp = ct.clamp(self.min_mireds, self.max_mireds);
                        envelope
                            .with("dimming", brightness_to_dimming(b))
                            .with(
                                "color_temperature",
                                mireds_to_device_pct(ct, self.min_mireds, self.max_mireds),
                            )
                    }
                    LightType::Rgb => {
                        let [r, g, b] = rgb.unwrap_or(self.rgb);
                        self.rgb = [r, g, b];
                        envelope.with("r", r).with("g", g).with("b", b)
                    }
                    LightType::Switch => envelope.with("power", true),
                };
                self.is_on = true;
                envelope
            }
            Intent::TurnOff => {
                let envelope = self.envelope()?;
                let envelope = match self.light_type {
                    LightType::Dimmer => {
                        self.brightness = 0;
                        envelope.with("dimming", 0)
                    }
                    LightType::Cct => {
                        self.brightness = 0;
                        self.color_temp = self.min_mireds;
                        envelope.with("dimming", 0).with("color_temperature", 0)
                    }
                    LightType::Rgb => {
                        self.rgb = [0, 0, 0];
                        envelope.with("r", 0).with("g", 0).with("b", 0)
                    }
                    LightType::Switch => envelope.with("power", false),
                };
                self.is_on = false;
                envelope
            }
            other => return Err(other.unsupported(ShadowKind::Light)),
        };

        Ok(vec![OutboundCommand::json(&topic, envelope)])
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        attributes.insert("light_type".into(), json!(self.light_type.wire_tag()));
        match self.light_type {
            LightType::Dimmer => {
                attributes.insert("brightness".into(), json!(self.brightness));
            }
            LightType::Cct => {
                attributes.insert("brightness".into(), json!(self.brightness));
                attributes.insert("color_temp".into(), json!(self.color_temp));
                attributes.insert("min_mireds".into(), json!(self.min_mireds));
                attributes.insert("max_mireds".into(), json!(self.max_mireds));
            }
            LightType::Rgb => {
                attributes.insert("rgb_color".into(), json!(self.rgb));
            }
            LightType::Switch => {}
        }
        ShadowState {
            state: if self.is_on { "on" } else { "off" }.to_string(),
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

    fn light(v: Value) -> LightShadow {
        LightShadow::from_payload(&DiscoveryPayload::new(v.as_object().unwrap().clone())).unwrap()
    }

    fn envelope_json(cmd: &OutboundCommand) -> Value {
        match &cmd.payload {
            OutboundPayload::Json(env) => serde_json::to_value(env).unwrap(),
            OutboundPayload::Raw(text) => panic!("expected JSON, got raw {text:?}"),
        }
    }

    #[test]
    fn test_dimming_truncates_both_ways() {
        assert_eq!(dimming_to_brightness(50), 127);
        assert_eq!(dimming_to_brightness(100), 255);
        assert_eq!(dimming_to_brightness(0), 0);
        assert_eq!(dimming_to_brightness(150), 255);
        assert_eq!(brightness_to_dimming(128), 50);
        assert_eq!(brightness_to_dimming(255), 100);
        assert_eq!(brightness_to_dimming(2), 0);

        for b in 0..=255u8 {
            let back = dimming_to_brightness(brightness_to_dimming(b));
            assert!(i64::from(b) - i64::from(back) <= 3, "{b} -> {back}");
        }
        for d in 0..=100 {
            let back = brightness_to_dimming(dimming_to_brightness(d));
            assert!((d - back).abs() <= 1, "{d} -> {back}");
        }
    }

    #[test]
    fn test_cct_scaling() {
        assert_eq!(mireds_to_device_pct(154, 154, 370), 100);
        assert_eq!(mireds_to_device_pct(370, 154, 370), 0);
        assert_eq!(mireds_to_device_pct(262, 154, 370), 50);
        assert_eq!(mireds_to_device_pct(100, 154, 370), 100);
        assert_eq!(device_pct_to_mireds(100, 154, 370), 154);
        assert_eq!(device_pct_to_mireds(0, 154, 370), 370);
        assert_eq!(device_pct_to_mireds(50, 154, 370), 262);
        assert_eq!(mireds_to_device_pct(200, 300, 300), 0);
    }

    #[test]
    fn test_type_detection() {
        assert_eq!(light(json!({"unique_id": "1"})).light_type(), LightType::Dimmer);
        assert_eq!(
            light(json!({"unique_id": "1", "color_temp_command_topic": "x"})).light_type(),
            LightType::Cct
        );
        assert_eq!(light(json!({"unique_id": "1", "type": "rgb"})).light_type(), LightType::Rgb);
        assert_eq!(light(json!({"unique_id": "1", "type": "relay"})).light_type(), LightType::Switch);
    }

    #[test]
    fn test_dimmer_status_overwrites_and_is_idempotent() {
        let mut l = light(json!({"unique_id": "42"}));
        let status = json!({"address": 42, "dimmer": {"dimming": 50}});
        assert!(l.apply_status(&status));
        let first = l.state();
        assert!(l.apply_status(&status));
        assert_eq!(l.state(), first);
        assert!(l.is_on());
        assert_eq!(l.brightness(), 127);

        // other kinds' sub-objects are ignored
        assert!(!l.apply_status(&json!({"address": 42, "cct": {"dimming": 0}})));
        assert!(l.is_on());

        assert!(l.apply_status(&json!({"address": 42, "dimmer": {"dimming": 0}})));
        assert!(!l.is_on());
    }

    #[test]
    fn test_cct_status_partial_fields() {
        let mut l = light(json!({"unique_id": "1", "type": "cct"}));
        l.apply_status(&json!({"cct": {"dimming": 100, "color_temperature": 0}}));
        assert_eq!(l.color_temp(), 370);
        l.apply_status(&json!({"cct": {"dimming": 20}}));
        assert_eq!(l.color_temp(), 370);
        assert_eq!(l.brightness(), 51);
    }

    #[test]
    fn test_rgb_on_when_any_channel_set() {
        let mut l = light(json!({"unique_id": "1", "type": "rgb"}));
        l.apply_status(&json!({"rgb": {"r": 0, "g": 0, "b": 3}}));
        assert!(l.is_on());
        assert_eq!(l.rgb(), [0, 0, 3]);
        l.apply_status(&json!({"rgb": {"r": 0, "g": 0, "b": 0}}));
        assert!(!l.is_on());
    }

    #[test]
    fn test_switch_light_power() {
        let mut l = light(json!({"unique_id": "1", "type": "relay"}));
        assert!(l.apply_status(&json!({"switch": {"power": true}})));
        assert!(l.is_on());
        assert!(l.apply_status(&json!({"power": false})));
        assert!(!l.is_on());
    }

    #[test]
    fn test_encode_dimmer_turn_on() {
        let mut l = light(json!({"unique_id": "1", "address": 60590, "command_topic": "LYT/1/cmd"}));
        let cmds = l
            .encode(
                &Intent::TurnOn {
                    brightness: Some(128),
                    color_temp: None,
                    rgb: None,
                    percentage: None,
                },
                &PathTemplates,
            )
            .unwrap();

        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].topic, "LYT/1/cmd");
        assert_eq!(
            envelope_json(&cmds[0]),
            json!({"version": "v1.0", "address": 60590, "type": "dimmer", "dimming": 50})
        );
        assert!(l.is_on());
        assert_eq!(l.brightness(), 128);
    }

    #[test]
    fn test_encode_cct_turn_off_resets() {
        let mut l = light(json!({"unique_id": "7", "type": "cct", "command_topic": "c"}));
        let cmds = l.encode(&Intent::TurnOff, &PathTemplates).unwrap();
        assert_eq!(
            envelope_json(&cmds[0]),
            json!({"version": "v1.0", "address": "7", "type": "cct", "dimming": 0, "color_temperature": 0})
        );
        assert!(!l.is_on());
        assert_eq!(l.color_temp(), DEFAULT_MIN_MIREDS);
    }

    #[test]
    fn test_encode_errors() {
        let mut l = light(json!({"unique_id": "1"}));
        assert!(matches!(
            l.encode(&Intent::TurnOff, &PathTemplates),
            Err(CommandError::MissingConfig("command_topic"))
        ));

        let mut l = light(json!({"unique_id": "1", "command_topic": "c"}));
        assert!(matches!(
            l.encode(&Intent::OpenCover, &PathTemplates),
            Err(CommandError::Unsupported { kind: "light", .. })
        ));
    }
}
