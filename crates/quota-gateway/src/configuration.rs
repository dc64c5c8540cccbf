use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://aiproxy.hzh.sealos.run";
pub const DEFAULT_DAILY_REQUEST_LIMIT: i64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Gateway settings. Built once at startup and handed to each component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    /// Path of the SQLite database file.
    pub database: String,
    pub daily_request_limit: i64,
    pub debug: bool,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Service credential used for relayed completions. Never the caller's key.
    pub api_key: String,
    pub connect_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    /// Bounds a whole relayed completion, streamed body included.
    pub relay_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            database: "gateway.db".to_string(),
            daily_request_limit: DEFAULT_DAILY_REQUEST_LIMIT,
            debug: false,
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            api_key: String::new(),
            connect_timeout_secs: 10,
            validation_timeout_secs: 30,
            relay_timeout_secs: 300,
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not an empty map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read `path` if it exists; a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(path)?;
        log::info!("loaded config file {}", path.display());
        Self::from_yaml(&yaml)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Empty values are ignored; values that
    /// fail to parse are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("LISTEN") {
            self.listen = v;
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.database = v;
        }
        if let Some(v) = get("UPSTREAM_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = get("UPSTREAM_API_KEY") {
            self.upstream.api_key = v;
        }
        if let Some(v) = get("UPSTREAM_RELAY_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.upstream.relay_timeout_secs = secs,
                Err(_) => log::error!("invalid UPSTREAM_RELAY_TIMEOUT_SECS: {v}"),
            }
        }
        if let Some(v) = get("DAILY_REQUEST_LIMIT") {
            match v.parse() {
                Ok(limit) => self.daily_request_limit = limit,
                Err(_) => log::error!("invalid DAILY_REQUEST_LIMIT: {v}"),
            }
        }
        if let Some(v) = get("DEBUG") {
            match parse_bool(&v) {
                Some(debug) => self.debug = debug,
                None => log::error!("invalid DEBUG: {v}"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".into()));
        }
        if self.daily_request_limit < 0 {
            return Err(ConfigError::Invalid(format!(
                "daily_request_limit must not be negative, got {}",
                self.daily_request_limit
            )));
        }
        let base = self.upstream.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "upstream.base_url must be an http(s) URL, got '{base}'"
            )));
        }
        if self.upstream.relay_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upstream.relay_timeout_secs must be positive".into(),
            ));
        }
        if self.upstream.api_key.is_empty() {
            log::warn!("upstream.api_key is empty; relayed requests will be unauthenticated");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
