//! Runner configuration: endpoint, storage locations, and the coordination
//! settings, read from an optional TOML file and overridden from `REVIEW_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use review_coordination::{ConfigError, CoordinationConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token. Unset means no auth.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "default".to_string(),
            api_key_env: "REVIEW_LLM_API_KEY".to_string(),
            timeout_secs: 120,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub llm: LlmConfig,
    /// Where review state is checkpointed.
    pub state_dir: PathBuf,
    /// Where posted reviews are written.
    pub output_dir: PathBuf,
    pub coordination: CoordinationConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            state_dir: PathBuf::from(".review-state"),
            output_dir: PathBuf::from(".review-output"),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Read `path` if given, apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `REVIEW_*` overrides looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("REVIEW_LLM_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = var("REVIEW_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(secs) = var("REVIEW_LLM_TIMEOUT_SECONDS").and_then(|s| s.parse().ok()) {
            self.llm.timeout_secs = secs;
        }
        if let Some(dir) = var("REVIEW_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("REVIEW_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(max) = var("REVIEW_BUDGET_MAX_UNITS").and_then(|s| s.parse().ok()) {
            self.coordination.budget.max_units = max;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::new("llm.base_url", "must not be empty"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::new("llm.timeout_secs", "must be > 0"));
        }
        self.coordination.validate()
    }
}
