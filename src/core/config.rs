//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::{PipelineError, Result};
use crate::core::models::RetryPolicy;

/// Whether the smart cache outlives a single project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    /// One cache per project; dropped when the project pipeline finishes
    Project,
    /// One cache for the whole process, shared across projects
    Shared,
}

/// Configuration for the translation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub target_lang: String,
    pub max_concurrent: usize,
    pub max_rps: f64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub backoff_multiplier: f64,
    pub timeout_ms: u64,
    pub cache_scope: CacheScope,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("TRANSLATE_API_KEY").unwrap_or_default(),
            api_endpoint: std::env::var("TRANSLATE_API_ENDPOINT")
                .unwrap_or_else(|_| "https://api.example.com/v1/translate".to_string()),
            target_lang: "zh".to_string(),
            max_concurrent: 4,
            max_rps: 4.0,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_jitter_ms: 250,
            backoff_multiplier: 2.0,
            timeout_ms: 30000,
            cache_scope: CacheScope::Project,
        }
    }
}

impl TranslatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("TRANSLATE_API_KEY").map_err(|_| PipelineError::ConfigError {
            message: "TRANSLATE_API_KEY environment variable is required".to_string(),
        })?;

        let api_endpoint = std::env::var("TRANSLATE_API_ENDPOINT")
            .unwrap_or_else(|_| "https://api.example.com/v1/translate".to_string());

        let mut config = Self {
            api_key,
            api_endpoint,
            ..Default::default()
        };

        if let Ok(v) = std::env::var("TARGET_LANG") {
            config.target_lang = v;
        }
        config.max_concurrent = Self::env_parse("MAX_CONCURRENT", config.max_concurrent)?;
        config.max_rps = Self::env_parse("MAX_RPS", config.max_rps)?;
        config.max_retries = Self::env_parse("MAX_RETRIES", config.max_retries)?;
        config.retry_delay_ms = Self::env_parse("RETRY_DELAY_MS", config.retry_delay_ms)?;
        config.retry_jitter_ms = Self::env_parse("RETRY_JITTER_MS", config.retry_jitter_ms)?;
        config.backoff_multiplier =
            Self::env_parse("BACKOFF_MULTIPLIER", config.backoff_multiplier)?;
        config.timeout_ms = Self::env_parse("REQUEST_TIMEOUT_MS", config.timeout_ms)?;

        config.cache_scope = match std::env::var("CACHE_SCOPE").as_deref() {
            Ok("shared") => CacheScope::Shared,
            Ok("project") | Err(_) => CacheScope::Project,
            Ok(other) => {
                return Err(PipelineError::ConfigError {
                    message: format!("CACHE_SCOPE must be 'project' or 'shared', got '{}'", other),
                })
            }
        };

        Ok(config)
    }

    /// Parse an env var or fall back to the default
    fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
        match std::env::var(name) {
            Ok(raw) => raw.parse::<T>().map_err(|_| PipelineError::ConfigError {
                message: format!("invalid value for {}: '{}'", name, raw),
            }),
            Err(_) => Ok(default),
        }
    }

    /// Load from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(PipelineError::ConfigError {
                message: "API key is required".to_string(),
            });
        }
        if self.api_endpoint.is_empty() {
            return Err(PipelineError::ConfigError {
                message: "API endpoint is required".to_string(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(PipelineError::ConfigError {
                message: "max_concurrent must be greater than 0".to_string(),
            });
        }
        if self.max_rps <= 0.0 {
            return Err(PipelineError::ConfigError {
                message: "max_rps must be greater than 0".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(PipelineError::ConfigError {
                message: "max_retries must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Retry policy derived from the retry fields
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay_ms: self.retry_delay_ms,
            multiplier: self.backoff_multiplier,
            jitter_ms: self.retry_jitter_ms,
        }
    }
}
