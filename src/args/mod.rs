//! Provider-native request arguments.
//!
//! Every builder takes the normalized message list plus the base generation
//! args and returns a [`ProviderArgs`]: target model, headers, and JSON body.
//! Disabled generation or network fields never reach the body.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod thinking;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::dispatch::ChatMessage;
use crate::model::{GenerationSettings, ModelConfig};

use self::thinking::ThinkingMatrix;

/// Fully built call arguments for one provider request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderArgs {
    pub model: String,
    pub headers: BTreeMap<String, String>,
    pub body: Map<String, Value>,
}

impl ProviderArgs {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// Sampling parameters whose enable flag is on. `None` means "do not send".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationArgs {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
}

impl GenerationArgs {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        let pick = |enabled: bool, value: f64| enabled.then_some(value);
        Self {
            temperature: pick(settings.temperature_custom_enable, settings.temperature),
            top_p: pick(settings.top_p_custom_enable, settings.top_p),
            presence_penalty: pick(
                settings.presence_penalty_custom_enable,
                settings.presence_penalty,
            ),
            frequency_penalty: pick(
                settings.frequency_penalty_custom_enable,
                settings.frequency_penalty,
            ),
        }
    }

    /// Enabled fields under their snake_case wire names.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, f64)> {
        [
            ("temperature", self.temperature),
            ("top_p", self.top_p),
            ("presence_penalty", self.presence_penalty),
            ("frequency_penalty", self.frequency_penalty),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }

    pub fn write_into(&self, body: &mut Map<String, Value>) {
        for (name, value) in self.entries() {
            body.insert(name.to_string(), Value::from(value));
        }
    }
}

/// Builds provider-native args for one model.
pub struct ArgsBuilder<'a> {
    model: &'a ModelConfig,
    matrix: &'a ThinkingMatrix,
    default_headers: &'a BTreeMap<String, String>,
}

impl<'a> ArgsBuilder<'a> {
    pub fn new(
        model: &'a ModelConfig,
        matrix: &'a ThinkingMatrix,
        default_headers: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            model,
            matrix,
            default_headers,
        }
    }

    /// Default headers, overridden by enabled custom headers.
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.default_headers.clone();
        headers.extend(self.model.enabled_headers());
        headers
    }

    fn output_token_limit(&self) -> u32 {
        self.model.threshold.output_token_limit
    }
}

/// Overlay `extra` onto `body`, key by key. `extra` wins.
pub fn merge_body(body: &mut Map<String, Value>, extra: Map<String, Value>) {
    for (key, value) in extra {
        body.insert(key, value);
    }
}

/// Non-blank system message contents, joined by a blank line.
pub fn join_system(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.is_system())
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}
