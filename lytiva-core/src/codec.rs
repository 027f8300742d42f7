//! Payload codec.
//!
//! Inbound: best-effort UTF-8, strict JSON. Outbound: either a structured
//! command envelope serialized as JSON, or a raw preconfigured string for the
//! legacy kinds (curtain open/close, scenes, raw switch payloads).

use rumqttc::QoS;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::discovery::DeviceAddress;
use crate::error::CodecError;
use crate::transport::Transport;

/// Protocol tag carried by every structured command.
pub const PROTOCOL_VERSION: &str = "v1.0";

/// Decode raw bytes into a JSON document.
///
/// Invalid UTF-8 sequences are replaced rather than rejected; the JSON parse
/// itself is strict.
pub fn decode_json(payload: &[u8]) -> Result<Value, CodecError> {
    let text = String::from_utf8_lossy(payload);
    Ok(serde_json::from_str(&text)?)
}

/// Decode a payload that must be a JSON object (discovery and status).
pub fn decode_object(payload: &[u8]) -> Result<Map<String, Value>, CodecError> {
    match decode_json(payload)? {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(CodecError::NotAnObject("array")),
        Value::String(_) => Err(CodecError::NotAnObject("string")),
        Value::Number(_) => Err(CodecError::NotAnObject("number")),
        Value::Bool(_) => Err(CodecError::NotAnObject("bool")),
        Value::Null => Err(CodecError::NotAnObject("null")),
    }
}

/// Raw payload text plus its parsed form, if it parsed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub text: String,
    pub json: Option<Value>,
}

impl RawMessage {
    pub fn from_bytes(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload).into_owned();
        let json = serde_json::from_str(&text).ok();
        Self { text, json }
    }

    /// Top-level field of the parsed document.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.json.as_ref().and_then(|v| v.get(key))
    }
}

/// Structured command: `{"version", "address", "type", ...fields}`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    pub version: &'static str,
    pub address: DeviceAddress,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(address: DeviceAddress, kind: &'static str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            kind,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// What goes on the wire for a command.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Json(CommandEnvelope),
    Raw(String),
}

impl OutboundPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            OutboundPayload::Json(envelope) => Ok(serde_json::to_vec(envelope)?),
            OutboundPayload::Raw(text) => Ok(text.as_bytes().to_vec()),
        }
    }
}

/// A command ready to publish.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub topic: String,
    pub payload: OutboundPayload,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundCommand {
    pub fn json(topic: &str, envelope: CommandEnvelope) -> Self {
        Self {
            topic: topic.to_string(),
            payload: OutboundPayload::Json(envelope),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn raw(topic: &str, text: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: OutboundPayload::Raw(text.into()),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Publish a command, fire-and-forget. Failures are logged and swallowed.
pub fn publish_command(transport: &dyn Transport, command: &OutboundCommand) {
    let bytes = match command.payload.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to encode command for {}: {}", command.topic, e);
            return;
        }
    };
    tracing::debug!(
        "Publishing to {}: {}",
        command.topic,
        String::from_utf8_lossy(&bytes)
    );
    if let Err(e) = transport.publish(&command.topic, bytes, command.qos, command.retain) {
        tracing::error!("Failed to publish to {}: {}", command.topic, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MemoryTransport;

    #[test]
    fn test_decode_json_object() {
        let doc = decode_json(br#"{"address": 42, "dimmer": {"dimming": 50}}"#).unwrap();
        assert_eq!(doc["address"], 42);
        assert_eq!(doc["dimmer"]["dimming"], 50);
    }

    #[test]
    fn test_decode_tolerates_bad_utf8_inside_strings() {
        let mut payload = br#"{"name": "lamp"#.to_vec();
        payload.push(0xff);
        payload.extend_from_slice(br#"", "address": 7}"#);
        let doc = decode_json(&payload).unwrap();
        assert_eq!(doc["address"], 7);
        assert!(doc["name"].as_str().unwrap().starts_with("lamp"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_json(b"online").is_err());
        assert!(decode_json(b"{\"address\": ").is_err());
        assert!(matches!(
            decode_object(b"[1, 2]"),
            Err(CodecError::NotAnObject("array"))
        ));
    }

    #[test]
    fn test_raw_message_keeps_text_when_not_json() {
        let msg = RawMessage::from_bytes(b"ON");
        assert_eq!(msg.text, "ON");
        assert!(msg.json.is_none());
        assert!(msg.field("state").is_none());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = CommandEnvelope::new(DeviceAddress::Int(42), "dimmer").with("dimming", 50);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"version": "v1.0", "address": 42, "type": "dimmer", "dimming": 50})
        );
    }

    #[test]
    fn test_publish_raw_and_json() {
        let transport = MemoryTransport::new();
        publish_command(&transport, &OutboundCommand::raw("cur/cmd", "OPEN"));
        publish_command(
            &transport,
            &OutboundCommand::json(
                "x/cmd",
                CommandEnvelope::new(DeviceAddress::Text("9".into()), "switch").with("power", true),
            ),
        );

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "cur/cmd");
        assert_eq!(published[0].payload, b"OPEN");
        let doc: Value = serde_json::from_slice(&published[1].payload).unwrap();
        assert_eq!(doc["address"], "9");
        assert_eq!(doc["power"], true);
    }
}
