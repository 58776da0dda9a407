//! Configuration loader and validator for the flash-sale scheduling engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub marketplace: Marketplace,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sweep_interval_ms: u64,
    pub sweep_batch_size: u32,
}

/// Marketplace partner API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marketplace {
    pub api_base: String,
    /// Optional pass-through proxy; every outbound call is rewritten to
    /// `proxy_base?url=<encoded target>` when set.
    #[serde(default)]
    pub proxy_base: Option<String>,
    pub http_timeout_secs: u64,
    /// Tokens within this many seconds of expiry are refreshed proactively.
    pub token_refresh_buffer_secs: i64,
    /// Provider error codes that mean "token invalid/expired" and trigger
    /// the reactive refresh-and-retry path.
    pub auth_error_codes: Vec<String>,
    pub partner: Partner,
}

/// Process-wide fallback partner identity, used when a shop has no linked
/// credential row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partner {
    pub partner_id: i64,
    pub partner_key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_ms must be > 0"));
    }
    if cfg.app.sweep_batch_size == 0 {
        return Err(ConfigError::Invalid("app.sweep_batch_size must be > 0"));
    }

    if cfg.marketplace.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("marketplace.api_base must be non-empty"));
    }
    if cfg.marketplace.http_timeout_secs == 0 {
        return Err(ConfigError::Invalid("marketplace.http_timeout_secs must be > 0"));
    }
    if cfg.marketplace.token_refresh_buffer_secs < 0 {
        return Err(ConfigError::Invalid(
            "marketplace.token_refresh_buffer_secs must be >= 0",
        ));
    }
    if cfg.marketplace.auth_error_codes.is_empty() {
        return Err(ConfigError::Invalid(
            "marketplace.auth_error_codes must list at least one code",
        ));
    }

    if cfg.marketplace.partner.partner_id <= 0 {
        return Err(ConfigError::Invalid("marketplace.partner.partner_id must be > 0"));
    }
    if cfg.marketplace.partner.partner_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "marketplace.partner.partner_key must be non-empty",
        ));
    }

    Ok(())
}

/// Returns an example YAML document matching the schema.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sweep_interval_ms: 30000
  sweep_batch_size: 10

marketplace:
  api_base: "https://partner.example-marketplace.com"
  proxy_base: ""
  http_timeout_secs: 15
  token_refresh_buffer_secs: 300
  auth_error_codes:
    - "error_auth"
    - "invalid_access_token"
    - "error_token"
  partner:
    partner_id: 1000001
    partner_key: "YOUR_PARTNER_KEY"
"#
}
