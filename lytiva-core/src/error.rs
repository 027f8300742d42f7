//! Error types for the bridge core.
//!
//! None of these escalate past the engine: transport and decode failures are
//! logged and the offending message is dropped.

use thiserror::Error;

/// Failures talking to the MQTT broker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connection failed: {0}")]
    Connect(String),
    #[error("no CONNACK from {broker} within {secs}s")]
    ConnectTimeout { broker: String, secs: u64 },
}

/// Failures turning raw payload bytes into a document.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),
    #[error("template render error: {0}")]
    Render(String),
}

/// Failures turning a host intent into a wire command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{kind} does not support {intent}")]
    Unsupported { kind: &'static str, intent: String },
    #[error("{0} is not configured for this device")]
    MissingConfig(&'static str),
    #[error("{value:?} is not a valid {what}")]
    InvalidValue { what: &'static str, value: String },
    #[error("no shadow for {0}")]
    UnknownEntity(String),
    #[error("engine is not running")]
    EngineStopped,
    #[error(transparent)]
    Template(#[from] TemplateError),
}
