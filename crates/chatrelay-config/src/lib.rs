use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub http: Http,
    pub chat: Chat,
    pub nlu: Nlu,
    #[serde(default)]
    pub actions: HashMap<String, ActionTarget>,
    #[serde(default)]
    pub lookup: Option<Lookup>,
    pub travis: Travis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Chat-platform side: inbound webhook tokens and the outbound
/// incoming-webhook URL template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Semicolon-separated list of tokens accepted on the inbound webhook.
    pub tokens: String,
    /// Outbound URL template; `%s` is replaced with the per-user token.
    pub url: String,
    /// Per-user outbound secret tokens.
    #[serde(default)]
    pub user_tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nlu {
    pub url: String,
    /// Per-channel agent tokens; the `others` entry is the fallback and
    /// must be present.
    pub client_tokens: HashMap<String, String>,
    /// Actions whose name contains this marker always reply with the
    /// fulfillment speech, skipping the action call.
    pub force_output_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTarget {
    pub url: String,
    #[serde(default)]
    pub secure_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lookup {
    pub url: String,
    #[serde(default)]
    pub secure_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Travis {
    pub public_key_url: String,
    /// Regular expression whose capture group 1 extracts the PEM block
    /// from the key-discovery response body.
    pub public_key_regexp: String,
}

fn default_timeout_ms() -> u64 {
    5_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.http.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "http.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.chat.tokens.split(';').all(|t| t.trim().is_empty()) {
        return Err(ConfigError::UnsupportedConfig(
            "chat.tokens must list at least one inbound token".to_string(),
        ));
    }
    if !cfg.chat.url.contains("%s") {
        return Err(ConfigError::UnsupportedConfig(
            "chat.url must contain a %s token placeholder".to_string(),
        ));
    }
    if !cfg.nlu.client_tokens.contains_key("others") {
        return Err(ConfigError::UnsupportedConfig(
            "nlu.client_tokens must contain an `others` fallback entry".to_string(),
        ));
    }
    Ok(())
}
