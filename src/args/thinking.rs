//! Model-family thinking-effort mapping.
//!
//! Vendors rename model families often, so the mapping is data: a builtin
//! table shipped with the crate (`thinking.toml`) that a config file can
//! replace wholesale.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::RequestError;
use crate::model::ThinkingLevel;

const BUILTIN: &str = include_str!("thinking.toml");

/// Case-insensitive model-family pattern, matched anywhere in the model id.
#[derive(Debug, Clone)]
pub struct FamilyPattern(Regex);

impl FamilyPattern {
    pub fn is_match(&self, model_id: &str) -> bool {
        self.0.is_match(model_id)
    }
}

impl TryFrom<String> for FamilyPattern {
    type Error = regex::Error;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map(Self)
    }
}

impl<'de> Deserialize<'de> for FamilyPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::try_from(pattern).map_err(serde::de::Error::custom)
    }
}

/// Per-level values. A missing level means "send nothing".
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct LevelTable<T> {
    #[serde(default)]
    pub off: Option<T>,
    #[serde(default)]
    pub low: Option<T>,
    #[serde(default)]
    pub medium: Option<T>,
    #[serde(default)]
    pub high: Option<T>,
}

impl<T> Default for LevelTable<T> {
    fn default() -> Self {
        Self {
            off: None,
            low: None,
            medium: None,
            high: None,
        }
    }
}

impl<T> LevelTable<T> {
    pub fn get(&self, level: ThinkingLevel) -> Option<&T> {
        match level {
            ThinkingLevel::Off => self.off.as_ref(),
            ThinkingLevel::Low => self.low.as_ref(),
            ThinkingLevel::Medium => self.medium.as_ref(),
            ThinkingLevel::High => self.high.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FamilyRule<T> {
    pub pattern: FamilyPattern,
    #[serde(flatten)]
    pub levels: LevelTable<T>,
}

// ---------------------------------------------------------------------------
// Provider-native values
// ---------------------------------------------------------------------------

/// OpenAI-compatible contribution: a reasoning-effort string and/or a
/// vendor `thinking` toggle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenAiThinking {
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub thinking: Option<bool>,
}

impl OpenAiThinking {
    pub fn apply(&self, body: &mut Map<String, Value>) {
        if let Some(effort) = &self.reasoning_effort {
            body.insert("reasoning_effort".to_string(), json!(effort));
        }
        if let Some(enabled) = self.thinking {
            let kind = if enabled { "enabled" } else { "disabled" };
            body.insert("thinking".to_string(), json!({ "type": kind }));
        }
    }
}

/// Google `thinkingConfig`: older families take a token budget (0 disables),
/// newer ones a named level.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoogleThinking {
    Budget { budget: u32, include_thoughts: bool },
    Level { level: String, include_thoughts: bool },
}

impl GoogleThinking {
    pub fn to_config(&self) -> Value {
        match self {
            Self::Budget {
                budget,
                include_thoughts,
            } => json!({ "thinkingBudget": budget, "includeThoughts": include_thoughts }),
            Self::Level {
                level,
                include_thoughts,
            } => json!({ "thinkingLevel": level, "includeThoughts": include_thoughts }),
        }
    }
}

/// Anthropic `thinking` block, serialized as the API expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnthropicThinking {
    Disabled,
    Enabled { budget_tokens: u32 },
}

impl AnthropicThinking {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

// ---------------------------------------------------------------------------
// ThinkingMatrix
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ThinkingMatrix {
    pub version: u32,
    #[serde(default)]
    pub openai: Vec<FamilyRule<OpenAiThinking>>,
    #[serde(default)]
    pub google: Vec<FamilyRule<GoogleThinking>>,
    #[serde(default)]
    pub anthropic: Vec<FamilyRule<AnthropicThinking>>,
    /// Used for Anthropic models that no rule recognizes.
    #[serde(default)]
    pub anthropic_fallback: LevelTable<AnthropicThinking>,
}

impl Default for ThinkingMatrix {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ThinkingMatrix {
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN).expect("builtin thinking matrix is valid")
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RequestError> {
        toml::from_str(text)
            .map_err(|e| RequestError::Config(format!("invalid thinking matrix: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, RequestError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RequestError::Config(format!(
                "failed to read thinking matrix {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn openai(&self, model_id: &str, level: ThinkingLevel) -> Option<&OpenAiThinking> {
        lookup(&self.openai, model_id)?.get(level)
    }

    pub fn google(&self, model_id: &str, level: ThinkingLevel) -> Option<&GoogleThinking> {
        lookup(&self.google, model_id)?.get(level)
    }

    pub fn anthropic(&self, model_id: &str, level: ThinkingLevel) -> Option<&AnthropicThinking> {
        match lookup(&self.anthropic, model_id) {
            Some(levels) => levels.get(level),
            None => self.anthropic_fallback.get(level),
        }
    }
}

fn lookup<'a, T>(rules: &'a [FamilyRule<T>], model_id: &str) -> Option<&'a LevelTable<T>> {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(model_id))
        .map(|rule| &rule.levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ThinkingLevel::*;

    fn google_level(level: &str) -> GoogleThinking {
        GoogleThinking::Level {
            level: level.to_string(),
            include_thoughts: true,
        }
    }

    fn google_budget(budget: u32) -> GoogleThinking {
        GoogleThinking::Budget {
            budget,
            include_thoughts: true,
        }
    }

    #[test]
    fn builtin_parses() {
        let matrix = ThinkingMatrix::builtin();
        assert_eq!(matrix.version, 1);
        assert!(!matrix.openai.is_empty());
        assert!(!matrix.google.is_empty());
        assert!(!matrix.anthropic.is_empty());
    }

    #[test]
    fn openai_gpt5_effort() {
        let matrix = ThinkingMatrix::builtin();
        let off = matrix.openai("gpt-5-mini", Off).unwrap();
        assert_eq!(off.reasoning_effort.as_deref(), Some("none"));
        assert_eq!(off.thinking, None);
        let high = matrix.openai("GPT-5", High).unwrap();
        assert_eq!(high.reasoning_effort.as_deref(), Some("high"));
    }

    #[test]
    fn openai_doubao_sets_effort_and_toggle() {
        let matrix = ThinkingMatrix::builtin();
        let off = matrix.openai("doubao-seed-1-6-250615", Off).unwrap();
        assert_eq!(off.reasoning_effort.as_deref(), Some("minimal"));
        assert_eq!(off.thinking, Some(false));
        let low = matrix.openai("doubao-seed-1-6-250615", Low).unwrap();
        assert_eq!(low.reasoning_effort.as_deref(), Some("low"));
        assert_eq!(low.thinking, Some(true));
    }

    #[test]
    fn openai_toggle_families() {
        let matrix = ThinkingMatrix::builtin();
        for model in ["glm-4.6", "kimi-k2", "deepseek-v3.2"] {
            assert_eq!(matrix.openai(model, Off).unwrap().thinking, Some(false));
            assert_eq!(matrix.openai(model, Medium).unwrap().thinking, Some(true));
            assert_eq!(matrix.openai(model, Medium).unwrap().reasoning_effort, None);
        }
    }

    #[test]
    fn unknown_families_get_nothing() {
        let matrix = ThinkingMatrix::builtin();
        assert!(matrix.openai("qwen-max", High).is_none());
        assert!(matrix.google("gemini-1.5-pro", High).is_none());
    }

    #[test]
    fn google_named_levels() {
        let matrix = ThinkingMatrix::builtin();
        assert_eq!(matrix.google("gemini-3.1-pro-preview", Off), Some(&google_level("LOW")));
        assert_eq!(
            matrix.google("gemini-3.1-pro-preview", Medium),
            Some(&google_level("MEDIUM"))
        );
        assert_eq!(matrix.google("gemini-3-pro-preview", Medium), Some(&google_level("LOW")));
        assert_eq!(matrix.google("gemini-3-pro-preview", High), Some(&google_level("HIGH")));
        assert_eq!(
            matrix.google("gemini-3-flash-preview", Off),
            Some(&google_level("MINIMAL"))
        );
    }

    #[test]
    fn google_budgets() {
        let matrix = ThinkingMatrix::builtin();
        assert_eq!(matrix.google("gemini-2.5-pro", Off), Some(&google_budget(128)));
        assert_eq!(matrix.google("gemini-2.5-pro", Low), Some(&google_budget(384)));
        assert_eq!(matrix.google("gemini-2.5-flash", High), Some(&google_budget(1024)));
        assert_eq!(
            matrix.google("gemini-2.5-flash", Off),
            Some(&GoogleThinking::Budget {
                budget: 0,
                include_thoughts: false
            })
        );
    }

    #[test]
    fn google_config_shape() {
        assert_eq!(
            google_budget(384).to_config(),
            json!({"thinkingBudget": 384, "includeThoughts": true})
        );
        assert_eq!(
            google_level("HIGH").to_config(),
            json!({"thinkingLevel": "HIGH", "includeThoughts": true})
        );
    }

    #[test]
    fn anthropic_known_and_fallback() {
        let matrix = ThinkingMatrix::builtin();
        assert_eq!(
            matrix.anthropic("claude-sonnet-4-5", Off),
            Some(&AnthropicThinking::Disabled)
        );
        assert_eq!(
            matrix.anthropic("claude-3-7-sonnet-latest", Medium),
            Some(&AnthropicThinking::Enabled {
                budget_tokens: 1536
            })
        );
        assert_eq!(matrix.anthropic("claude-3-5-haiku", Off), None);
        assert_eq!(
            matrix.anthropic("claude-3-5-haiku", High),
            Some(&AnthropicThinking::Enabled {
                budget_tokens: 2048
            })
        );
    }

    #[test]
    fn anthropic_block_serializes_like_the_api() {
        let block = serde_json::to_value(AnthropicThinking::Enabled {
            budget_tokens: 1024,
        })
        .unwrap();
        assert_eq!(block, json!({"type": "enabled", "budget_tokens": 1024}));
        assert_eq!(
            serde_json::to_value(AnthropicThinking::Disabled).unwrap(),
            json!({"type": "disabled"})
        );
    }

    #[test]
    fn override_replaces_builtin() {
        let matrix = ThinkingMatrix::from_toml_str(
            r#"
            version = 2

            [[openai]]
            pattern = 'qwen3'
            high = { reasoning_effort = "high" }
            "#,
        )
        .unwrap();
        assert_eq!(matrix.version, 2);
        assert!(matrix.openai("gpt-5", High).is_none());
        assert!(matrix.openai("Qwen3-235B", Low).is_none());
        assert_eq!(
            matrix
                .openai("Qwen3-235B", High)
                .unwrap()
                .reasoning_effort
                .as_deref(),
            Some("high")
        );
        assert!(matrix.anthropic("claude-x", High).is_none());
    }

    #[test]
    fn partial_anthropic_tables_parse() {
        let matrix = ThinkingMatrix::from_toml_str(
            r#"
            version = 3

            [[anthropic]]
            pattern = 'claude-next'
            high = { type = "enabled", budget_tokens = 4096 }

            [anthropic_fallback]
            off = { type = "disabled" }
            "#,
        )
        .unwrap();
        assert_eq!(
            matrix.anthropic("claude-next-1", High),
            Some(&AnthropicThinking::Enabled {
                budget_tokens: 4096
            })
        );
        assert_eq!(matrix.anthropic("claude-next-1", Low), None);
        assert_eq!(
            matrix.anthropic("claude-other", Off),
            Some(&AnthropicThinking::Disabled)
        );
        assert_eq!(matrix.anthropic("claude-other", High), None);
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let err = ThinkingMatrix::from_toml_str("version = 1\n[[openai]]\npattern = '('\n")
            .unwrap_err();
        assert!(matches!(err, RequestError::Config(_)));
    }
}
