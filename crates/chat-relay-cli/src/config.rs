//! Configuration file support

use chat_relay::RelayConfig;
use chat_relay::config::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default model when neither the flag nor the config file names one
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Configuration for chat-relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model identifier
    pub model_id: Option<String>,
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    /// API key (alternative to environment variables)
    pub api_key: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// System prompt prepended to every conversation
    pub system_prompt: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-relay")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CHAT_RELAY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default path
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init_at(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        let default_config = Config {
            model_id: Some(DEFAULT_MODEL.to_string()),
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            api_key: None,
            temperature: Some(chat_relay::types::DEFAULT_TEMPERATURE),
            system_prompt: None,
        };
        default_config.save_to(path)
    }

    /// API key from the config file, then the environment
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("CHAT_RELAY_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    /// Build the relay configuration. An absent key stays empty so the relay
    /// reports it.
    pub fn relay_config(&self) -> RelayConfig {
        let config = RelayConfig::new(
            self.model_id.as_deref().unwrap_or(DEFAULT_MODEL),
            self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            self.resolve_api_key().unwrap_or_default(),
        );
        match self.temperature {
            Some(t) => config.with_temperature(t),
            None => config,
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chat-relay configuration file
# Place at ~/.config/chat-relay/config.toml (Linux), or point
# CHAT_RELAY_CONFIG_PATH at another file.

# Model identifier sent to the endpoint
model_id = "gpt-4o-mini"

# Any OpenAI-compatible endpoint; /chat/completions is appended
base_url = "https://api.openai.com/v1"

# Sampling temperature
temperature = 0.7

# Optional system prompt
# system_prompt = "You are a helpful assistant."

# API key (optional - CHAT_RELAY_API_KEY or OPENAI_API_KEY also work)
# api_key = "sk-..."
"#
}
