//! Value templates.
//!
//! Discovery payloads carry Jinja-style templates (`value_template`,
//! `mode_state_template`, `temperature_command_template`, ...) that map a
//! structured payload to a flat value. Two strategies are available:
//!
//! - [`JinjaTemplates`]: minijinja with the HA-flavoured filters devices
//!   actually use (`int`, `float`, `round`, `default`, ...).
//! - [`PathTemplates`]: `{{ value }}` and dotted `{{ value_json.a.b }}`
//!   lookups only, for deployments that want no template language at all.
//!
//! Context variables:
//!   value      — raw MQTT payload string
//!   value_json — parsed JSON from the payload (empty object if unparseable)

use std::sync::Arc;

use minijinja::{Environment, ErrorKind, Value};
use serde::Deserialize;

use crate::codec::RawMessage;
use crate::error::TemplateError;

/// Renders a template source against a payload context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, source: &str, ctx: &TemplateContext) -> Result<String, TemplateError>;
}

/// Which [`TemplateEngine`] the bridge uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStrategy {
    #[default]
    Jinja,
    Path,
}

impl TemplateStrategy {
    pub fn engine(self) -> Arc<dyn TemplateEngine> {
        match self {
            TemplateStrategy::Jinja => Arc::new(JinjaTemplates::new()),
            TemplateStrategy::Path => Arc::new(PathTemplates),
        }
    }
}

/// Context variables for template rendering.
#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    pub value: Option<String>,
    pub value_json: Option<serde_json::Value>,
}

impl TemplateContext {
    /// Context for an inbound message. `value_json` falls back to `{}`.
    pub fn from_message(msg: &RawMessage) -> Self {
        Self {
            value: Some(msg.text.clone()),
            value_json: Some(
                msg.json
                    .clone()
                    .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            ),
        }
    }

    /// Context for a command template: only `value` is bound.
    pub fn from_value(value: impl ToString) -> Self {
        Self {
            value: Some(value.to_string()),
            value_json: None,
        }
    }
}

/// Render and trim; `None` (logged) if the template fails.
pub fn render_value(engine: &dyn TemplateEngine, source: &str, msg: &RawMessage) -> Option<String> {
    match engine.render(source, &TemplateContext::from_message(msg)) {
        Ok(rendered) => Some(rendered.trim().to_string()),
        Err(e) => {
            tracing::warn!("Template {:?} failed on {:?}: {}", source, msg.text, e);
            None
        }
    }
}

// ── minijinja ───────────────────────────────────────────

pub struct JinjaTemplates {
    env: Environment<'static>,
}

impl Default for JinjaTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaTemplates {
    pub fn new() -> Self {
        let mut env = Environment::new();

        // HA's filters are forgiving where minijinja's builtins raise.
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("round", filter_round);
        env.add_filter("default", filter_default);
        env.add_filter("iif", filter_iif);

        env.add_function("float", fn_float);
        env.add_function("int", fn_int);

        Self { env }
    }
}

impl TemplateEngine for JinjaTemplates {
    fn render(&self, source: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let value = ctx.value.as_deref().map(Value::from);
        let value_json = ctx.value_json.as_ref().map(json_to_jinja);

        let context = match (value, value_json) {
            (Some(v), Some(vj)) => minijinja::context! { value => v, value_json => vj },
            (Some(v), None) => minijinja::context! { value => v },
            (None, Some(vj)) => minijinja::context! { value_json => vj },
            (None, None) => minijinja::context! {},
        };

        self.env.render_str(source, context).map_err(|e| match e.kind() {
            ErrorKind::SyntaxError => TemplateError::Parse(e.to_string()),
            _ => TemplateError::Render(e.to_string()),
        })
    }
}

fn json_to_jinja(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::from(n.to_string())
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => Value::from(arr.iter().map(json_to_jinja).collect::<Vec<_>>()),
        serde_json::Value::Object(map) => Value::from(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_jinja(v)))
                .collect::<std::collections::BTreeMap<String, Value>>(),
        ),
    }
}

fn filter_int(value: Value) -> Value {
    if let Some(s) = value.as_str() {
        Value::from(s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0))
    } else if let Some(f) = as_f64(&value) {
        Value::from(f as i64)
    } else {
        Value::from(0i64)
    }
}

fn filter_float(value: Value) -> Value {
    Value::from(as_f64(&value).unwrap_or(0.0))
}

fn filter_round(value: Value, precision: Option<Value>) -> Value {
    let p = precision.and_then(|v| as_f64(&v)).unwrap_or(0.0) as i32;
    match as_f64(&value) {
        Some(f) => {
            let factor = 10f64.powi(p);
            Value::from((f * factor).round() / factor)
        }
        None => value,
    }
}

fn filter_default(value: Value, default: Option<Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn filter_iif(value: Value, if_true: Value, if_false: Option<Value>) -> Value {
    if value.is_true() {
        if_true
    } else {
        if_false.unwrap_or_else(|| Value::from(""))
    }
}

fn fn_float(value: Value, default: Option<Value>) -> Value {
    match as_f64(&value) {
        Some(f) => Value::from(f),
        None => default.unwrap_or(Value::from(0.0f64)),
    }
}

fn fn_int(value: Value, default: Option<Value>) -> Value {
    match as_f64(&value) {
        Some(f) => Value::from(f as i64),
        None => default.unwrap_or(Value::from(0i64)),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    if let Some(s) = v.as_str() {
        s.trim().parse::<f64>().ok()
    } else if let Ok(i) = i64::try_from(v.clone()) {
        Some(i as f64)
    } else {
        f64::try_from(v.clone()).ok()
    }
}

// ── dotted paths ────────────────────────────────────────

/// `{{ value }}` / `{{ value_json.a.b }}` substitution, nothing else.
pub struct PathTemplates;

impl TemplateEngine for PathTemplates {
    fn render(&self, source: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(source.len());
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| TemplateError::Parse(format!("unclosed expression in {source:?}")))?;
            out.push_str(&eval_path(after[..end].trim(), ctx)?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn eval_path(expr: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    if expr.contains('|') || expr.contains('(') {
        return Err(TemplateError::Parse(format!(
            "{expr:?}: filters and calls need the jinja engine"
        )));
    }

    let mut segments = expr.split('.');
    match segments.next() {
        Some("value") => {
            if segments.next().is_some() {
                return Err(TemplateError::Parse(format!("{expr:?}: value has no fields")));
            }
            Ok(ctx.value.clone().unwrap_or_default())
        }
        Some("value_json") => {
            let mut node = ctx
                .value_json
                .as_ref()
                .ok_or_else(|| TemplateError::Render("value_json is not bound".to_string()))?;
            for segment in segments {
                node = match node {
                    serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    other => other.get(segment),
                }
                .ok_or_else(|| TemplateError::Render(format!("{expr:?}: no field {segment:?}")))?;
            }
            Ok(scalar_text(node))
        }
        _ => Err(TemplateError::Render(format!("{expr:?}: unknown variable"))),
    }
}

fn scalar_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jinja(source: &str, payload: &str) -> String {
        JinjaTemplates::new()
            .render(source, &TemplateContext::from_message(&RawMessage::from_bytes(payload.as_bytes())))
            .unwrap()
    }

    #[test]
    fn test_basic_template() {
        assert_eq!(jinja("{{ value }}", "42.5"), "42.5");
    }

    #[test]
    fn test_value_json() {
        assert_eq!(jinja("{{ value_json.temperature }}", r#"{"temperature": 72.3}"#), "72.3");
    }

    #[test]
    fn test_nested_json() {
        let payload = r#"{"ir_ac": {"mode": "cool", "temperature": 24}}"#;
        assert_eq!(jinja("{{ value_json.ir_ac.mode }}", payload), "cool");
    }

    #[test]
    fn test_round_and_int_filters() {
        assert_eq!(jinja("{{ value_json.temp | round(1) }}", r#"{"temp": 72.345}"#), "72.3");
        assert_eq!(jinja("{{ value_json.count | int }}", r#"{"count": "42"}"#), "42");
    }

    #[test]
    fn test_non_json_payload_binds_empty_object() {
        assert_eq!(jinja("{{ value_json.state | default('none') }}", "ON"), "none");
    }

    #[test]
    fn test_command_template_with_value() {
        let engine = JinjaTemplates::new();
        let out = engine
            .render(
                r#"{"address": 7, "mode": "{{ value }}"}"#,
                &TemplateContext::from_value("cool"),
            )
            .unwrap();
        assert_eq!(out, r#"{"address": 7, "mode": "cool"}"#);
    }

    #[test]
    fn test_jinja_syntax_error_is_parse_error() {
        let err = JinjaTemplates::new()
            .render("{{ value ", &TemplateContext::from_value("x"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Parse(_)));
    }

    #[test]
    fn test_render_value_trims_and_swallows_errors() {
        let engine = JinjaTemplates::new();
        let msg = RawMessage::from_bytes(br#"{"state": "ON"}"#);
        assert_eq!(render_value(&engine, "  {{ value_json.state }}\n", &msg).as_deref(), Some("ON"));
        assert_eq!(render_value(&engine, "{% if %}", &msg), None);
    }

    #[test]
    fn test_path_templates() {
        let msg = RawMessage::from_bytes(br#"{"a": {"b": [10, 20]}, "s": "on", "n": null}"#);
        let ctx = TemplateContext::from_message(&msg);
        let engine = PathTemplates;

        assert_eq!(engine.render("{{ value_json.a.b.1 }}", &ctx).unwrap(), "20");
        assert_eq!(engine.render("state={{value_json.s}}", &ctx).unwrap(), "state=on");
        assert_eq!(engine.render("{{ value_json.n }}", &ctx).unwrap(), "");
        assert!(engine.render("{{ value_json.missing }}", &ctx).is_err());
        assert!(engine.render("{{ value_json.s | upper }}", &ctx).is_err());
        assert!(engine.render("{{ value_json.s", &ctx).is_err());
    }

    #[test]
    fn test_path_templates_raw_value() {
        let ctx = TemplateContext::from_value(23);
        assert_eq!(PathTemplates.render("T{{ value }}", &ctx).unwrap(), "T23");
    }
}
