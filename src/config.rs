//! Configuration management
//!
//! A single TOML file backs the process: OpenRouter credentials for
//! `agent::llm::OpenRouterClient` and the dialogue core's own configuration
//! surface (`dialogue::config::DialogueConfig`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenRouter API settings
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    /// Real-time dialogue core configuration
    #[serde(default)]
    pub dialogue: crate::dialogue::config::DialogueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// API key is stored in keyring, this is just a reference
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Default chat-completion model for the dialogue core's `ChatEngine`
    #[serde(default = "default_model_str")]
    pub default_model: String,
}

fn default_model_str() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self { api_key: None, default_model: default_model_str() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { openrouter: OpenRouterConfig::default(), dialogue: Default::default() }
    }
}

impl Config {
    /// Load configuration from file, writing out the defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "xiaozhi-core", "xiaozhi-core")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "xiaozhi-core", "xiaozhi-core")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Set API key in the OS keyring
pub fn set_api_key(key: &str) -> Result<()> {
    crate::security::keyring::set_api_key(key)?;
    println!("API key stored securely.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.openrouter.default_model, config.openrouter.default_model);
        assert_eq!(parsed.dialogue.server_port, config.dialogue.server_port);
    }
}
