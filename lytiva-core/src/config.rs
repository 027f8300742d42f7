//! Bridge configuration.
//!
//! Loaded from an optional YAML file (path in `LYTIVA_CONFIG`), then
//! overridden by `LYTIVA_*` environment variables.

use std::path::Path;

use serde::Deserialize;

use crate::template::TemplateStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Stable id of this bridge instance; the MQTT client id derives from it.
    /// When unset, one is derived from the broker and discovery prefix.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_availability_topic")]
    pub availability_topic: String,
    #[serde(default = "default_status_topics")]
    pub status_topics: Vec<String>,
    #[serde(default)]
    pub template_engine: TemplateStrategy,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_availability_topic() -> String {
    "homeassistant/status".to_string()
}

fn default_status_topics() -> Vec<String> {
    vec![
        "LYT/+/NODE/E/STATUS".to_string(),
        "LYT/+/GROUP/E/STATUS".to_string(),
    ]
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: default_port(),
            username: None,
            password: None,
            keepalive_secs: default_keepalive(),
            discovery_prefix: default_discovery_prefix(),
            instance_id: None,
            availability_topic: default_availability_topic(),
            status_topics: default_status_topics(),
            template_engine: TemplateStrategy::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from `LYTIVA_CONFIG` (if set) plus environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("LYTIVA_CONFIG").ok();
        let config = match path {
            Some(p) => Self::load(Path::new(&p))?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply `LYTIVA_*` overrides from `lookup`, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(broker) = lookup("LYTIVA_BROKER") {
            self.broker = broker;
        }
        if let Some(port) = lookup("LYTIVA_PORT") {
            self.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("LYTIVA_PORT={port}: {e}"))?;
        }
        if let Some(username) = lookup("LYTIVA_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("LYTIVA_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(prefix) = lookup("LYTIVA_DISCOVERY_PREFIX") {
            self.discovery_prefix = prefix;
        }
        if let Some(id) = lookup("LYTIVA_INSTANCE_ID") {
            self.instance_id = Some(id);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.broker.trim().is_empty() {
            anyhow::bail!("no broker configured (set `broker` or LYTIVA_BROKER)");
        }
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.keepalive_secs == 0 {
            anyhow::bail!("keepalive_secs must be non-zero");
        }
        Ok(())
    }

    /// Configured instance id, else a name-based UUID of
    /// `mqtt://<broker>:<port>/<discovery_prefix>`, the same on every start.
    pub fn instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) => id.clone(),
            None => {
                let name = format!(
                    "mqtt://{}:{}/{}",
                    self.broker, self.port, self.discovery_prefix
                );
                uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, name.as_bytes())
                    .simple()
                    .to_string()
            }
        }
    }

    pub fn client_id(&self) -> String {
        format!("lytiva_{}", self.instance_id())
    }

    /// `<prefix>/+/+/config`
    pub fn discovery_filter(&self) -> String {
        format!("{}/+/+/config", self.discovery_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker: 192.168.1.10\nusername: lyt\npassword: secret").unwrap();

        let config = BridgeConfig::load(file.path())
            .unwrap()
            .with_overrides(no_env)
            .unwrap();

        assert_eq!(config.broker, "192.168.1.10");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keepalive_secs, 60);
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert_eq!(config.availability_topic, "homeassistant/status");
        assert_eq!(config.status_topics.len(), 2);
        assert_eq!(config.template_engine, TemplateStrategy::Jinja);
        assert_eq!(config.discovery_filter(), "homeassistant/+/+/config");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LYTIVA_BROKER", "mqtt.local"),
            ("LYTIVA_PORT", "8883"),
            ("LYTIVA_DISCOVERY_PREFIX", "lyt"),
            ("LYTIVA_INSTANCE_ID", "entry1"),
        ]);
        let config = BridgeConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker, "mqtt.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.discovery_filter(), "lyt/+/+/config");
        assert_eq!(config.client_id(), "lytiva_entry1");
    }

    fn broker(b: &'static str) -> impl Fn(&str) -> Option<String> {
        move |k| match k {
            "LYTIVA_BROKER" => Some(b.to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_default_instance_id_is_stable() {
        let first = BridgeConfig::default().with_overrides(broker("mqtt.local")).unwrap();
        let second = BridgeConfig::default().with_overrides(broker("mqtt.local")).unwrap();
        let other = BridgeConfig::default().with_overrides(broker("10.0.0.2")).unwrap();

        assert!(first.instance_id.is_none());
        assert_eq!(first.client_id(), second.client_id());
        assert_ne!(first.client_id(), other.client_id());
        assert!(first.client_id().starts_with("lytiva_"));
        assert_eq!(first.instance_id().len(), 32);
    }

    #[test]
    fn test_missing_broker_rejected() {
        assert!(BridgeConfig::default().with_overrides(no_env).is_err());
    }

    #[test]
    fn test_bad_port_rejected() {
        let result = BridgeConfig::default().with_overrides(|k| match k {
            "LYTIVA_BROKER" => Some("b".to_string()),
            "LYTIVA_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_path_template_strategy_from_yaml() {
        let config: BridgeConfig =
            serde_yaml::from_str("broker: b\ntemplate_engine: path\n").unwrap();
        assert_eq!(config.template_engine, TemplateStrategy::Path);
    }
}
