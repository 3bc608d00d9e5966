//! Gateway configuration.

use std::time::Duration;

use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

/// Application configuration.
///
/// Sources, lowest to highest precedence: built-in defaults, an optional
/// `config.{toml,yaml,json}` next to the binary, then environment variables
/// named after the fields in upper case (`RATE_LIMIT_COUNT`, `OPENAI_API_KEY`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requests admitted per client per window.
    #[serde(default = "default_rate_limit_count")]
    pub rate_limit_count: u32,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,
    /// Maximum prompt size in characters, summed over all messages.
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    /// Relay events allowed in flight ahead of a slow client.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Use the first `X-Forwarded-For` hop as client identity.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_rate_limit_count() -> u32 {
    10
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_upstream_timeout() -> u64 {
    30
}
fn default_max_prompt_length() -> usize {
    32_000
}
fn default_max_tokens_limit() -> u32 {
    4096
}
fn default_max_tokens() -> u32 {
    500
}
fn default_temperature() -> f32 {
    0.7
}
fn default_stream_buffer() -> usize {
    4
}
fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rate_limit_count: default_rate_limit_count(),
            rate_limit_window_seconds: default_rate_limit_window(),
            upstream_timeout_seconds: default_upstream_timeout(),
            max_prompt_length: default_max_prompt_length(),
            max_tokens_limit: default_max_tokens_limit(),
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
            stream_buffer: default_stream_buffer(),
            trust_forwarded_for: false,
            openai_api_key: String::new(),
            openai_model: default_openai_model(),
            openai_base_url: default_openai_base_url(),
            environment: default_environment(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    /// Load configuration from file and environment variables, then validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check critical settings. The gateway refuses to start on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openai_api_key.trim().is_empty() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }
        if self.rate_limit_count == 0 {
            return Err(invalid("RATE_LIMIT_COUNT", "must be at least 1"));
        }
        if self.rate_limit_window_seconds == 0 {
            return Err(invalid("RATE_LIMIT_WINDOW_SECONDS", "must be at least 1"));
        }
        if self.upstream_timeout_seconds == 0 {
            return Err(invalid("UPSTREAM_TIMEOUT_SECONDS", "must be at least 1"));
        }
        if self.max_prompt_length == 0 {
            return Err(invalid("MAX_PROMPT_LENGTH", "must be at least 1"));
        }
        if self.stream_buffer == 0 {
            return Err(invalid("STREAM_BUFFER", "must be at least 1"));
        }
        if self.default_max_tokens == 0 || self.default_max_tokens > self.max_tokens_limit {
            return Err(invalid(
                "DEFAULT_MAX_TOKENS",
                format!("must be between 1 and {}", self.max_tokens_limit),
            ));
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(invalid("DEFAULT_TEMPERATURE", "must be between 0 and 2"));
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
