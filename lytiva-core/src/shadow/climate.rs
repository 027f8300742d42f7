//! IR-blown air conditioners.
//!
//! State arrives either as an `ir_ac` status object or on per-attribute state
//! topics rendered through templates. Commands use the configured
//! `<attr>_command_topic` + `<attr>_command_template` pair when present and a
//! structured `ir_ac` command on `command_topic` otherwise. IR units never
//! confirm, so every command is applied optimistically.

use serde_json::{json, Value};

use super::{
    as_bool, as_float, as_int, rendered_value, scalar_text, DeviceShadow, Identity, Intent,
    ShadowKind, ShadowState,
};
use crate::codec::{CommandEnvelope, OutboundCommand, RawMessage};
use crate::discovery::DiscoveryPayload;
use crate::error::CommandError;
use crate::template::{TemplateContext, TemplateEngine};

/// Device fan speeds; status `fan_speed` is a 0-based index into this list.
pub const FAN_SPEEDS: [&str; 6] = ["Vlow", "Low", "Med", "High", "Top", "Auto"];

pub const PRESET_ON: &str = "On";
pub const PRESET_OFF: &str = "Off";

pub const DEFAULT_MIN_TEMP: f64 = 16.0;
pub const DEFAULT_MAX_TEMP: f64 = 30.0;
const DEFAULT_TARGET_TEMP: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    Cool,
    Heat,
    Dry,
    FanOnly,
    Auto,
    Off,
}

impl HvacMode {
    pub const ALL: [HvacMode; 6] = [
        HvacMode::Cool,
        HvacMode::Heat,
        HvacMode::Dry,
        HvacMode::FanOnly,
        HvacMode::Auto,
        HvacMode::Off,
    ];

    /// Accepts host names and the device's `fan` spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cool" => Some(HvacMode::Cool),
            "heat" => Some(HvacMode::Heat),
            "dry" => Some(HvacMode::Dry),
            "fan_only" | "fan" => Some(HvacMode::FanOnly),
            "auto" => Some(HvacMode::Auto),
            "off" => Some(HvacMode::Off),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HvacMode::Cool => "cool",
            HvacMode::Heat => "heat",
            HvacMode::Dry => "dry",
            HvacMode::FanOnly => "fan_only",
            HvacMode::Auto => "auto",
            HvacMode::Off => "off",
        }
    }

    /// Spelling used in `ir_ac` commands.
    pub fn wire(self) -> &'static str {
        match self {
            HvacMode::FanOnly => "fan",
            other => other.as_str(),
        }
    }
}

/// A state topic and the template that extracts its value.
#[derive(Debug, Clone, Default)]
struct Channel {
    topic: Option<String>,
    template: Option<String>,
}

impl Channel {
    fn from_payload(payload: &DiscoveryPayload, topic_key: &str, template_key: &str) -> Self {
        Self {
            topic: payload.string(topic_key),
            template: payload.string(template_key),
        }
    }

    fn is(&self, topic: &str) -> bool {
        self.topic.as_deref() == Some(topic)
    }

    /// Template output, else `fallback_key` of the JSON body, else the raw text.
    fn extract(&self, msg: &RawMessage, fallback_key: &str, templates: &dyn TemplateEngine) -> Option<String> {
        if self.template.is_some() {
            return rendered_value(self.template.as_deref(), msg, templates);
        }
        Some(match msg.field(fallback_key) {
            Some(v) if !v.is_null() => scalar_text(v),
            _ => msg.text.trim().to_string(),
        })
    }

    /// Render the command template with `value` bound.
    fn render_command(
        &self,
        value: impl ToString,
        templates: &dyn TemplateEngine,
    ) -> Result<Option<OutboundCommand>, CommandError> {
        match (&self.topic, &self.template) {
            (Some(topic), Some(template)) => {
                let rendered = templates.render(template, &TemplateContext::from_value(value))?;
                Ok(Some(OutboundCommand::raw(topic, rendered.trim())))
            }
            _ => Ok(None),
        }
    }
}

pub struct ClimateShadow {
    ident: Identity,
    command_topic: Option<String>,
    mode_state: Channel,
    target_temp_state: Channel,
    current_temp_state: Channel,
    fan_mode_state: Channel,
    preset_state: Channel,
    mode_command: Channel,
    temp_command: Channel,
    fan_mode_command: Channel,
    preset_command: Channel,
    hvac_modes: Vec<HvacMode>,
    fan_modes: Vec<String>,
    preset_modes: Vec<String>,
    min_temp: f64,
    max_temp: f64,
    temp_step: f64,
    hvac_mode: HvacMode,
    target_temp: f64,
    current_temp: Option<f64>,
    fan_mode: Option<String>,
    preset: String,
}

impl ClimateShadow {
    pub fn from_payload(payload: &DiscoveryPayload) -> Option<Self> {
        let ident = Identity::from_payload(payload, "Lytiva AC")?;

        let mut hvac_modes: Vec<HvacMode> = match payload.strings("modes") {
            Some(modes) => modes.iter().filter_map(|m| HvacMode::parse(m)).collect(),
            None => HvacMode::ALL.to_vec(),
        };
        if !hvac_modes.contains(&HvacMode::Off) {
            hvac_modes.push(HvacMode::Off);
        }
        let fan_modes = payload
            .strings("fan_modes")
            .unwrap_or_else(|| FAN_SPEEDS.iter().map(|s| s.to_string()).collect());
        let preset_modes = payload
            .strings("preset_modes")
            .unwrap_or_else(|| vec![PRESET_ON.to_string(), PRESET_OFF.to_string()]);

        Some(Self {
            ident,
            command_topic: payload.string("command_topic"),
            mode_state: Channel::from_payload(payload, "mode_state_topic", "mode_state_template"),
            target_temp_state: Channel::from_payload(
                payload,
                "target_temperature_topic",
                "target_temperature_template",
            ),
            current_temp_state: Channel::from_payload(
                payload,
                "current_temperature_topic",
                "current_temperature_template",
            ),
            fan_mode_state: Channel::from_payload(payload, "fan_mode_state_topic", "fan_mode_state_template"),
            preset_state: Channel::from_payload(
                payload,
                "preset_mode_state_topic",
                "preset_mode_state_template",
            ),
            mode_command: Channel::from_payload(payload, "mode_command_topic", "mode_command_template"),
            temp_command: Channel::from_payload(
                payload,
                "temperature_command_topic",
                "temperature_command_template",
            ),
            fan_mode_command: Channel::from_payload(
                payload,
                "fan_mode_command_topic",
                "fan_mode_command_template",
            ),
            preset_command: Channel::from_payload(
                payload,
                "preset_mode_command_topic",
                "preset_mode_command_template",
            ),
            hvac_modes,
            fan_mode: fan_modes.first().cloned(),
            fan_modes,
            preset_modes,
            min_temp: payload.f64_or("min_temp", DEFAULT_MIN_TEMP),
            max_temp: payload.f64_or("max_temp", DEFAULT_MAX_TEMP),
            temp_step: payload.f64_or("temp_step", 1.0),
            hvac_mode: HvacMode::Off,
            target_temp: DEFAULT_TARGET_TEMP,
            current_temp: None,
            preset: PRESET_OFF.to_string(),
        })
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.hvac_mode
    }

    pub fn target_temp(&self) -> f64 {
        self.target_temp
    }

    pub fn current_temp(&self) -> Option<f64> {
        self.current_temp
    }

    /// Inverse of the fan-mode command: the `FAN_SPEEDS` name when it is
    /// advertised, else the configured mode at that index, else the
    /// `FAN_SPEEDS` name.
    fn fan_mode_for_speed(&self, index: usize) -> Option<String> {
        let standard = FAN_SPEEDS.get(index).copied();
        if let Some(name) = standard.filter(|n| self.fan_modes.iter().any(|m| m == n)) {
            return Some(name.to_string());
        }
        if let Some(name) = self.fan_modes.get(index) {
            return Some(name.clone());
        }
        if let Some(name) = standard {
            tracing::debug!("Climate {}: fan speed {} is not an advertised mode", self.ident.id, name);
        }
        standard.map(str::to_string)
    }

    pub fn fan_mode(&self) -> Option<&str> {
        self.fan_mode.as_deref()
    }

    pub fn preset(&self) -> &str {
        &self.preset
    }

    fn structured(&self, fields: &[(&str, Value)]) -> Result<OutboundCommand, CommandError> {
        let topic = self
            .command_topic
            .as_deref()
            .ok_or(CommandError::MissingConfig("command_topic"))?;
        let envelope = fields
            .iter()
            .fold(CommandEnvelope::new(self.ident.require_address()?, "ir_ac"), |env, (k, v)| {
                env.with(k, v.clone())
            });
        Ok(OutboundCommand::json(topic, envelope))
    }

    fn set_power(
        &mut self,
        on: bool,
        templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        let preset = if on { PRESET_ON } else { PRESET_OFF };
        let command = match self.preset_command.render_command(preset, templates)? {
            Some(cmd) => cmd,
            None => self.structured(&[("power", json!(on))])?,
        };
        self.preset = preset.to_string();
        Ok(vec![command])
    }
}

impl DeviceShadow for ClimateShadow {
    fn identity(&self) -> &Identity {
        &self.ident
    }

    fn kind(&self) -> ShadowKind {
        ShadowKind::Climate
    }

    fn apply_status(&mut self, status: &Value) -> bool {
        let ir = match status.get("ir_ac").and_then(Value::as_object) {
            Some(ir) => ir,
            None => return false,
        };
        let mut applied = false;

        if let Some(on) = ir.get("power").and_then(as_bool) {
            self.preset = if on { PRESET_ON } else { PRESET_OFF }.to_string();
            applied = true;
        }
        if let Some(mode) = ir.get("mode").and_then(Value::as_str).and_then(HvacMode::parse) {
            self.hvac_mode = mode;
            applied = true;
        }
        if let Some(t) = ir.get("temperature").and_then(as_float) {
            self.target_temp = t;
            applied = true;
        }
        if let Some(t) = ir.get("current_temperature").and_then(as_float) {
            self.current_temp = Some(t);
            applied = true;
        }
        if let Some(i) = ir.get("fan_speed").and_then(as_int) {
            match usize::try_from(i).ok().and_then(|i| self.fan_mode_for_speed(i)) {
                Some(name) => {
                    self.fan_mode = Some(name);
                    applied = true;
                }
                None => tracing::debug!("Climate {}: fan_speed {} out of range", self.ident.id, i),
            }
        }
        if applied {
            self.ident.available = true;
        }
        applied
    }

    fn state_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for channel in [
            &self.mode_state,
            &self.target_temp_state,
            &self.current_temp_state,
            &self.fan_mode_state,
            &self.preset_state,
        ] {
            if let Some(t) = &channel.topic {
                if !topics.contains(t) {
                    topics.push(t.clone());
                }
            }
        }
        topics
    }

    fn apply_topic(&mut self, topic: &str, msg: &RawMessage, templates: &dyn TemplateEngine) -> bool {
        if let Some(addr) = msg.field("address").filter(|a| !a.is_null()) {
            if self.ident.address.is_some() && !self.ident.matches_address(addr) {
                tracing::debug!("Climate {}: message for {} ignored", self.ident.id, addr);
                return false;
            }
        }

        let mut updated = false;

        if self.mode_state.is(topic) {
            if let Some(mode) = self
                .mode_state
                .extract(msg, "mode", templates)
                .as_deref()
                .and_then(HvacMode::parse)
            {
                self.hvac_mode = mode;
                updated = true;
            }
        }
        if self.target_temp_state.is(topic) {
            if let Some(t) = self
                .target_temp_state
                .extract(msg, "temperature", templates)
                .and_then(|v| v.parse::<f64>().ok())
            {
                self.target_temp = t;
                updated = true;
            }
        }
        if self.current_temp_state.is(topic) {
            if let Some(t) = self
                .current_temp_state
                .extract(msg, "current_temperature", templates)
                .and_then(|v| v.parse::<f64>().ok())
            {
                self.current_temp = Some(t);
                updated = true;
            }
        }
        if self.fan_mode_state.is(topic) {
            if let Some(fan) = self.fan_mode_state.extract(msg, "fan_mode", templates) {
                if self.fan_modes.contains(&fan) {
                    self.fan_mode = Some(fan);
                    updated = true;
                }
            }
        }
        if self.preset_state.is(topic) {
            if let Some(preset) = self.preset_state.extract(msg, "preset", templates) {
                if self.preset_modes.contains(&preset) {
                    self.preset = preset;
                    updated = true;
                }
            }
        }

        if updated {
            self.ident.available = true;
        }
        updated
    }

    fn encode(
        &mut self,
        intent: &Intent,
        templates: &dyn TemplateEngine,
    ) -> Result<Vec<OutboundCommand>, CommandError> {
        match intent {
            Intent::SetHvacMode(mode) => {
                if !self.hvac_modes.contains(mode) {
                    return Err(CommandError::InvalidValue {
                        what: "hvac mode",
                        value: mode.as_str().to_string(),
                    });
                }
                let command = match self.mode_command.render_command(mode.as_str(), templates)? {
                    Some(cmd) => cmd,
                    None => self.structured(&[("mode", json!(mode.wire()))])?,
                };
                self.hvac_mode = *mode;
                Ok(vec![command])
            }
            Intent::SetTemperature(t) => {
                let t = t.max(self.min_temp).min(self.max_temp);
                let whole = t as i64;
                let command = match self.temp_command.render_command(whole, templates)? {
                    Some(cmd) => cmd,
                    None => self.structured(&[("temperature", json!(whole))])?,
                };
                self.target_temp = t;
                Ok(vec![command])
            }
            Intent::SetFanMode(name) => {
                if !self.fan_modes.contains(name) {
                    return Err(CommandError::InvalidValue {
                        what: "fan mode",
                        value: name.clone(),
                    });
                }
                let command = match self.fan_mode_command.render_command(name, templates)? {
                    Some(cmd) => cmd,
                    None => {
                        let index = FAN_SPEEDS
                            .iter()
                            .position(|s| s == name)
                            .or_else(|| self.fan_modes.iter().position(|s| s == name))
                            .unwrap_or(0);
                        self.structured(&[("fan_speed", json!(index))])?
                    }
                };
                self.fan_mode = Some(name.clone());
                Ok(vec![command])
            }
            Intent::SetPresetMode(preset) => {
                if !self.preset_modes.contains(preset) {
                    return Err(CommandError::InvalidValue {
                        what: "preset",
                        value: preset.clone(),
                    });
                }
                let command = match self.preset_command.render_command(preset, templates)? {
                    Some(cmd) => cmd,
                    None => self.structured(&[("power", json!(preset == PRESET_ON))])?,
                };
                self.preset = preset.clone();
                Ok(vec![command])
            }
            Intent::TurnOn { .. } => self.set_power(true, templates),
            Intent::TurnOff => self.set_power(false, templates),
            other => Err(other.unsupported(ShadowKind::Climate)),
        }
    }

    fn state(&self) -> ShadowState {
        let mut attributes = self.ident.base_attributes();
        let modes: Vec<&str> = self.hvac_modes.iter().map(|m| m.as_str()).collect();
        attributes.insert("hvac_modes".into(), json!(modes));
        attributes.insert("temperature".into(), json!(self.target_temp));
        attributes.insert("current_temperature".into(), json!(self.current_temp));
        attributes.insert("fan_mode".into(), json!(self.fan_mode));
        attributes.insert("fan_modes".into(), json!(self.fan_modes));
        attributes.insert("preset_mode".into(), json!(self.preset));
        attributes.insert("preset_modes".into(), json!(self.preset_modes));
        attributes.insert("min_temp".into(), json!(self.min_temp));
        attributes.insert("max_temp".into(), json!(self.max_temp));
        attributes.insert("target_temp_step".into(), json!(self.temp_step));
        ShadowState {
            state: self.hvac_mode.as_str().to_string(),
            attributes,
            available: self.ident.available,
        }
    }
}
