use crate::llm::OpenAIClient;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "config.json";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    #[default]
    OpenAi,
    Azure,
}

/// A selectable model, keyed by its display choice in `Config::models`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, or deployment name for Azure
    pub model_name: String,
    /// Whether the API key has access to this model
    #[serde(default = "default_true")]
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Interpreter invoked as `<interpreter> -c <code>`
    pub interpreter: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_type: ApiType,
    pub api_base: String,
    pub api_version: Option<String>,
    /// Falls back to the OPENAI_API_KEY environment variable when empty
    pub api_key: String,
    pub default_model: String,
    pub models: BTreeMap<String, ModelConfig>,
    /// Language of the code the model is asked to write
    pub worker_language: String,
    /// Code execution is disabled unless an interpreter is configured
    pub code_execution: Option<ExecutionConfig>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "GPT-4".to_string(),
            ModelConfig {
                model_name: "gpt-4".to_string(),
                available: true,
            },
        );
        models.insert(
            "GPT-3.5".to_string(),
            ModelConfig {
                model_name: "gpt-3.5-turbo".to_string(),
                available: true,
            },
        );

        Self {
            api_type: ApiType::OpenAi,
            api_base: OpenAIClient::default_base_url(),
            api_version: None,
            api_key: String::new(),
            default_model: "GPT-4".to_string(),
            models,
            worker_language: "python".to_string(),
            code_execution: None,
        }
    }
}

/// Get the path to the user level configuration file
pub fn get_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("synapse-chat").join(CONFIG_FILE_NAME))
}

impl Config {
    /// Loads the configuration from an explicit path, `./config.json`,
    /// the user config directory, or falls back to defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE_NAME)).chain(get_config_path());
        for path in candidates {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// The configured key, or the OPENAI_API_KEY environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        if !self.api_key.is_empty() {
            return Ok(self.api_key.clone());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => anyhow::bail!(
                "No API key configured: set api_key in the config file or {}",
                API_KEY_ENV
            ),
        }
    }

    pub fn model(&self, choice: &str) -> Option<&ModelConfig> {
        self.models.get(choice)
    }
}
