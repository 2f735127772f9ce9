//! Normalized model configuration record.
//!
//! Field names follow the persisted settings JSON, so a record saved by the
//! settings layer deserializes directly. Unknown enum strings fall back to the
//! defaults instead of failing the whole record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Wire protocol family of a model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ApiFormat {
    #[default]
    #[serde(rename = "OpenAI")]
    OpenAi,
    Google,
    Anthropic,
    #[serde(rename = "SakuraLLM")]
    Sakura,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Google => "Google",
            Self::Anthropic => "Anthropic",
            Self::Sakura => "SakuraLLM",
        }
    }

    /// Parse a persisted tag. Unknown tags are treated as OpenAI-compatible.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Google" => Self::Google,
            "Anthropic" => Self::Anthropic,
            "SakuraLLM" => Self::Sakura,
            _ => Self::OpenAi,
        }
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ApiFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Provider-agnostic thinking effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Self::Low,
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            _ => Self::Off,
        }
    }
}

impl<'de> Deserialize<'de> for ThinkingLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingSettings {
    pub level: ThinkingLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub temperature_custom_enable: bool,
    pub top_p: f64,
    pub top_p_custom_enable: bool,
    pub presence_penalty: f64,
    pub presence_penalty_custom_enable: bool,
    pub frequency_penalty: f64,
    pub frequency_penalty_custom_enable: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.95,
            temperature_custom_enable: false,
            top_p: 0.95,
            top_p_custom_enable: false,
            presence_penalty: 0.0,
            presence_penalty_custom_enable: false,
            frequency_penalty: 0.0,
            frequency_penalty_custom_enable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub input_token_limit: u32,
    pub output_token_limit: u32,
    /// 0 = unlimited.
    pub rpm_limit: u32,
    /// 0 = chosen by the scheduler.
    pub concurrency_limit: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            input_token_limit: 512,
            output_token_limit: 4096,
            rpm_limit: 0,
            concurrency_limit: 0,
        }
    }
}

/// Custom header/body overrides. Each half only applies when its flag is on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub extra_headers: BTreeMap<String, String>,
    pub extra_headers_custom_enable: bool,
    pub extra_body: serde_json::Map<String, serde_json::Value>,
    pub extra_body_custom_enable: bool,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub api_format: ApiFormat,
    pub api_url: String,
    /// Newline-separated key blob, as typed into the settings page.
    pub api_key: String,
    pub model_id: String,
    pub thinking: ThinkingSettings,
    pub generation: GenerationSettings,
    #[serde(alias = "thresholds")]
    pub threshold: Thresholds,
    #[serde(alias = "network_config")]
    pub request: NetworkSettings,
}

impl ModelConfig {
    /// Keys in blob order, blank lines and surrounding whitespace removed.
    pub fn api_keys(&self) -> Vec<String> {
        parse_api_keys(&self.api_key)
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.thinking.level
    }

    pub fn enabled_headers(&self) -> BTreeMap<String, String> {
        if self.request.extra_headers_custom_enable {
            self.request.extra_headers.clone()
        } else {
            BTreeMap::new()
        }
    }

    pub fn enabled_body(&self) -> serde_json::Map<String, serde_json::Value> {
        if self.request.extra_body_custom_enable {
            self.request.extra_body.clone()
        } else {
            serde_json::Map::new()
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_format", &self.api_format)
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("model_id", &self.model_id)
            .field("thinking", &self.thinking)
            .field("generation", &self.generation)
            .field("threshold", &self.threshold)
            .field("request", &self.request)
            .finish()
    }
}

/// Split a credential blob on newlines, trimming and dropping blank entries.
pub fn parse_api_keys(blob: &str) -> Vec<String> {
    blob.split('\n')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
