use crate::completion::DriverConfig;
use crate::llm::openai::{OpenAiConfig, DEFAULT_BASE_URL};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub provider_base_url: String,
    pub default_model: String,
    pub connect_timeout: Duration,
    /// `None` disables the stall guard.
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".ai-box"),
            provider_base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            connect_timeout: Duration::from_secs(15),
            stream_idle_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl AppConfig {
    /// Reads `AI_BOX_*` variables, loading a `.env` file first if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("AI_BOX_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("AI_BOX_PROVIDER_URL") {
            config.provider_base_url = url;
        }
        if let Some(model) = lookup("AI_BOX_DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Some(raw) = lookup("AI_BOX_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout =
                Duration::from_secs(parse_seconds("AI_BOX_CONNECT_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("AI_BOX_STREAM_IDLE_TIMEOUT_SECS") {
            // 0 turns the guard off
            config.stream_idle_timeout =
                match parse_seconds("AI_BOX_STREAM_IDLE_TIMEOUT_SECS", &raw)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                };
        }
        Ok(config)
    }

    pub fn provider(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.provider_base_url.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            stream_idle_timeout: self.stream_idle_timeout,
        }
    }
}

fn parse_seconds(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidSeconds {
            key,
            value: raw.to_string(),
        })
}
