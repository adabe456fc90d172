//! Translation backend contract and HTTP client

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslateError};
use crate::core::models::Glossary;

/// The external translation capability, treated as a black box.
///
/// Implementations classify their failures: transient faults are retried by
/// the scheduler, permanent ones are reported against the unit immediately.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        glossary: &Glossary,
    ) -> std::result::Result<String, TranslateError>;
}

/// HTTP translation client
#[derive(Debug, Clone)]
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout_ms: u64,
}

impl HttpTranslator {
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        config.validate()?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| crate::core::errors::PipelineError::ConfigError {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.api_endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    fn build_body(text: &str, target_lang: &str, glossary: &Glossary) -> serde_json::Value {
        let mut body = serde_json::json!({
            "text": text,
            "target_language": target_lang,
        });
        if !glossary.is_empty() {
            body["glossary"] = serde_json::json!({
                "version": glossary.version,
                "terms": glossary.terms,
            });
        }
        body
    }

    fn classify_send_error(&self, e: reqwest::Error) -> TranslateError {
        if e.is_timeout() {
            TranslateError::Timeout {
                ms: self.timeout_ms,
            }
        } else {
            TranslateError::Transient {
                message: e.to_string(),
                retry_after: None,
            }
        }
    }
}

#[async_trait]
impl TranslationBackend for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        glossary: &Glossary,
    ) -> std::result::Result<String, TranslateError> {
        let body = Self::build_body(text, target_lang, glossary);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();

        if status.is_success() {
            let json: serde_json::Value =
                response
                    .json()
                    .await
                    .map_err(|e| TranslateError::Transient {
                        message: format!("invalid response body: {}", e),
                        retry_after: None,
                    })?;

            let translation = json["translation"]
                .as_str()
                .ok_or_else(|| TranslateError::Transient {
                    message: "no translation in response".to_string(),
                    retry_after: None,
                })?
                .to_string();

            debug!("translated {} chars -> {} chars", text.len(), translation.len());
            return Ok(translation);
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(TranslateError::Transient {
                message: "rate limited by backend".to_string(),
                retry_after,
            });
        }

        let status_code = status.as_u16();
        let error_text = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            Err(TranslateError::Transient {
                message: format!("backend error {}: {}", status_code, error_text),
                retry_after: None,
            })
        } else {
            // 4xx: invalid input, auth, quota
            Err(TranslateError::Permanent {
                message: format!("backend rejected request ({}): {}", status_code, error_text),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translator_creation() {
        let config = TranslatorConfig {
            api_key: "test_key".to_string(),
            api_endpoint: "https://test.example/v1/translate".to_string(),
            ..Default::default()
        };
        assert!(HttpTranslator::new(&config).is_ok());
    }

    #[test]
    fn test_body_includes_glossary_only_when_present() {
        let empty = Glossary::empty();
        let body = HttpTranslator::build_body("hello", "zh", &empty);
        assert!(body.get("glossary").is_none());

        let mut glossary = Glossary::empty();
        glossary.version = "v2".to_string();
        glossary
            .terms
            .insert("dragon".to_string(), "龙".to_string());
        let body = HttpTranslator::build_body("hello", "zh", &glossary);
        assert_eq!(body["glossary"]["version"], "v2");
        assert_eq!(body["glossary"]["terms"]["dragon"], "龙");
    }
}
