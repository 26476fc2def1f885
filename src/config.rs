//! 配置模块：服务端点、重试、缓冲区等设置，支持 YAML 文件与环境变量。
//!
//! Configuration structures.
//!
//! A [`RelayConfig`] is built once by the composition root (from YAML, from the
//! environment, or by hand) and handed to each component's constructor. There
//! is no process-wide settings object.
//!
//! ```rust
//! use ai_relay::config::RelayConfig;
//!
//! let cfg = RelayConfig::from_yaml_str(r#"
//! service:
//!   provider: openai
//!   endpoint: https://api.example.com/v1
//!   api_key: sk-test
//!   deployment_name: gpt-4o
//! buffer:
//!   buffer_size: 40
//! "#).unwrap();
//!
//! assert_eq!(cfg.buffer.buffer_size, 40);
//! assert_eq!(cfg.service.max_tokens, 2000);
//! ```

use crate::error_code::ErrorKind;
use crate::resilience::{RetryPolicy, RetrySettings};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn default_api_version() -> String {
    "2024-02-15-preview".to_string()
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f64 {
    0.7
}
fn default_timeout_secs() -> f64 {
    30.0
}
fn default_max_retries() -> u32 {
    3
}

fn duration_secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Backend identity and per-call defaults.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub provider: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub deployment_name: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Nominal per-operation timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Connection retry budget (attempts = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ServiceConfig {
    pub fn new(
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        deployment_name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            deployment_name: deployment_name.into(),
            api_version: default_api_version(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    pub fn timeout(&self) -> Duration {
        duration_secs(self.timeout_secs)
    }
}

// Never print the credential.
impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***REDACTED***")
            .field("deployment_name", &self.deployment_name)
            .field("api_version", &self.api_version)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            backoff_multiplier: 2.0,
        }
    }
}

/// Display coalescing thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Flush once this many characters are pending (0 = every chunk).
    pub buffer_size: usize,
    pub flush_interval_secs: f64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval_secs: 0.1,
        }
    }
}

impl BufferSettings {
    pub fn flush_interval(&self) -> Duration {
        duration_secs(self.flush_interval_secs)
    }
}

/// Everything the composition root needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub query_retry: RetrySettings,
    #[serde(default)]
    pub buffer: BufferSettings,
}

impl RelayConfig {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            service,
            connection: ConnectionSettings::default(),
            query_retry: RetrySettings::default(),
            buffer: BufferSettings::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: RelayConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Build a config from process environment variables.
    ///
    /// Required: `ENDPOINT`, `API_KEY`, `MODEL`. Optional: `AI_PROVIDER`,
    /// `API_VERSION`, `AI_MAX_TOKENS`, `AI_TEMPERATURE`, `AI_REQUEST_TIMEOUT`,
    /// `AI_MAX_RETRIES`, `AI_BUFFER_SIZE`, `AI_FLUSH_INTERVAL`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Same as [`RelayConfig::from_env`] with an injectable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        let missing: Vec<&str> = ["ENDPOINT", "API_KEY", "MODEL"]
            .into_iter()
            .filter(|k| get(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::configuration_with_context(
                format!(
                    "Missing required environment variables: {}",
                    missing.join(", ")
                ),
                ErrorContext::new().with_source("env_loader"),
            ));
        }

        let mut service = ServiceConfig::new(
            get("AI_PROVIDER").unwrap_or_else(|| "azure_openai".to_string()),
            get("ENDPOINT").unwrap_or_default(),
            get("API_KEY").unwrap_or_default(),
            get("MODEL").unwrap_or_default(),
        );
        if let Some(v) = get("API_VERSION") {
            service.api_version = v;
        }
        if let Some(v) = get("AI_MAX_TOKENS") {
            service.max_tokens = parse_env("AI_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("AI_TEMPERATURE") {
            service.temperature = parse_env("AI_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("AI_REQUEST_TIMEOUT") {
            service.timeout_secs = parse_env("AI_REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = get("AI_MAX_RETRIES") {
            service.max_retries = parse_env("AI_MAX_RETRIES", &v)?;
        }

        let mut cfg = RelayConfig::new(service);
        if let Some(v) = get("AI_BUFFER_SIZE") {
            cfg.buffer.buffer_size = parse_env("AI_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = get("AI_FLUSH_INTERVAL") {
            cfg.buffer.flush_interval_secs = parse_env("AI_FLUSH_INTERVAL", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.service;
        require_non_empty("service.provider", &s.provider)?;
        require_non_empty("service.endpoint", &s.endpoint)?;
        require_non_empty("service.api_key", &s.api_key)?;

        url::Url::parse(&s.endpoint).map_err(|e| {
            invalid("service.endpoint", format!("not a valid URL: {}", e))
        })?;

        if !(0.0..=2.0).contains(&s.temperature) {
            return Err(invalid(
                "service.temperature",
                format!("must be within 0.0..=2.0, got {}", s.temperature),
            ));
        }
        if !(s.timeout_secs.is_finite() && s.timeout_secs > 0.0) {
            return Err(invalid(
                "service.timeout_secs",
                format!("must be positive, got {}", s.timeout_secs),
            ));
        }
        check_backoff(
            "connection",
            self.connection.base_delay_secs,
            self.connection.max_delay_secs,
            self.connection.backoff_multiplier,
        )?;
        check_backoff(
            "query_retry",
            self.query_retry.base_delay_secs,
            self.query_retry.max_delay_secs,
            self.query_retry.backoff_multiplier,
        )?;
        if !(self.buffer.flush_interval_secs.is_finite() && self.buffer.flush_interval_secs > 0.0)
        {
            return Err(invalid(
                "buffer.flush_interval_secs",
                format!("must be positive, got {}", self.buffer.flush_interval_secs),
            ));
        }
        Ok(())
    }

    /// Policy for the connection budget: connection and timeout failures only.
    pub fn connection_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&RetrySettings {
            max_retries: self.service.max_retries,
            base_delay_secs: self.connection.base_delay_secs,
            max_delay_secs: self.connection.max_delay_secs,
            backoff_multiplier: self.connection.backoff_multiplier,
            retry_on: vec![ErrorKind::Connection, ErrorKind::Timeout],
        })
    }

    /// Policy for the query budget.
    pub fn query_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.query_retry)
    }
}

fn invalid(field: &str, details: String) -> Error {
    Error::configuration_with_context(
        "Invalid configuration value",
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("config_validator"),
    )
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "is required".to_string()));
    }
    Ok(())
}

fn check_backoff(section: &str, base: f64, max: f64, multiplier: f64) -> Result<()> {
    if !(base.is_finite() && base >= 0.0) {
        return Err(invalid(
            &format!("{section}.base_delay_secs"),
            format!("must be non-negative, got {base}"),
        ));
    }
    if !(max.is_finite() && max >= base) {
        return Err(invalid(
            &format!("{section}.max_delay_secs"),
            format!("must be >= base_delay_secs, got {max}"),
        ));
    }
    if !(multiplier.is_finite() && multiplier >= 1.0) {
        return Err(invalid(
            &format!("{section}.backoff_multiplier"),
            format!("must be >= 1.0, got {multiplier}"),
        ));
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        Error::configuration_with_context(
            format!("Environment variable {} has an invalid value", key),
            ErrorContext::new()
                .with_field_path(key)
                .with_details(raw.to_string())
                .with_source("env_loader"),
        )
    })
}
