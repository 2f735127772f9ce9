use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::args::thinking::ThinkingMatrix;
use crate::model::ModelConfig;

pub const CONFIG_PATH_ENV: &str = "LINGO_CONFIG";
pub const REQUEST_TIMEOUT_ENV: &str = "LINGO_REQUEST_TIMEOUT";
pub const PROXY_ENV: &str = "LINGO_PROXY";

const DEFAULT_CONFIG_FILE: &str = "lingo.toml";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-request deadline, also used as the transport read timeout.
    pub request_timeout_secs: u64,
    pub proxy_enable: bool,
    pub proxy_url: String,
    /// TOML file replacing the builtin thinking matrix.
    pub thinking_matrix: Option<PathBuf>,
    pub active_model_id: String,
    pub models: Vec<ModelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            proxy_enable: false,
            proxy_url: String::new(),
            thinking_matrix: None,
            active_model_id: String::new(),
            models: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `$LINGO_CONFIG` (default `lingo.toml`), then apply env overrides.
    /// A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            tracing::warn!("config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(REQUEST_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.request_timeout_secs = secs,
                _ => tracing::warn!("ignoring invalid {REQUEST_TIMEOUT_ENV}={raw:?}"),
            }
        }
        if let Ok(proxy) = env::var(PROXY_ENV) {
            let proxy = proxy.trim();
            if !proxy.is_empty() {
                self.proxy_enable = true;
                self.proxy_url = proxy.to_string();
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Proxy URL, only when enabled and non-blank.
    pub fn proxy(&self) -> Option<String> {
        let url = self.proxy_url.trim();
        (self.proxy_enable && !url.is_empty()).then(|| url.to_string())
    }

    pub fn get_model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn active_model(&self) -> Option<&ModelConfig> {
        self.get_model(&self.active_model_id)
    }

    /// Builtin matrix unless an override file is configured.
    pub fn thinking_matrix(&self) -> Result<ThinkingMatrix> {
        match &self.thinking_matrix {
            Some(path) => Ok(ThinkingMatrix::load(path)?),
            None => Ok(ThinkingMatrix::builtin()),
        }
    }
}
