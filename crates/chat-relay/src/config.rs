//! Relay configuration: endpoint, model and credential

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DEFAULT_TEMPERATURE;

/// Default OpenAI-compatible endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection settings for an OpenAI-compatible chat endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Model identifier sent as `model`
    pub model_id: String,
    /// Base URL; `/chat/completions` is appended
    pub base_url: String,
    /// Bearer credential
    pub api_key: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

// Keeps the key out of logs.
impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl RelayConfig {
    pub fn new(
        model_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Check the preconditions for issuing a request
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config(
                "API key is not configured; set it in the settings".to_string(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(Error::Config("model id is empty".to_string()));
        }
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(Error::Config("base URL is empty".to_string()));
        }
        match reqwest::Url::parse(base) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(Error::Config(format!(
                "base URL must use http or https, got '{}'",
                url.scheme()
            ))),
            Err(e) => Err(Error::Config(format!("invalid base URL '{}': {}", base, e))),
        }
    }

    /// Full URL of the chat completions endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim().trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig::new("gpt-4o-mini", "https://api.example.com/v1", "sk-test")
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let mut config = valid();
        config.api_key = String::new();
        assert!(config.validate().unwrap_err().is_config());
        config.api_key = "   ".into();
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_empty_model_rejected() {
        let mut config = valid();
        config.model_id = String::new();
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let mut config = valid();
        config.base_url = "not a url".into();
        assert!(config.validate().unwrap_err().is_config());
        config.base_url = "ftp://example.com".into();
        assert!(config.validate().unwrap_err().is_config());
        config.base_url = String::new();
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let mut config = valid();
        assert_eq!(config.completions_url(), "https://api.example.com/v1/chat/completions");
        config.base_url = "http://localhost:8080/v1/".into();
        assert_eq!(config.completions_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("sk-test"));
    }
}
