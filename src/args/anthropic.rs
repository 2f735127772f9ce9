use serde_json::{Map, json};

use super::{ArgsBuilder, GenerationArgs, ProviderArgs, join_system, merge_body};
use crate::dispatch::ChatMessage;

impl ArgsBuilder<'_> {
    pub fn anthropic(&self, messages: &[ChatMessage], base: &GenerationArgs) -> ProviderArgs {
        let conversation: Vec<&ChatMessage> = messages.iter().filter(|m| !m.is_system()).collect();
        let thinking = self
            .matrix
            .anthropic(&self.model.model_id, self.model.thinking_level());
        let thinking_enabled = thinking.is_some_and(|t| t.is_enabled());

        let mut body = Map::new();
        body.insert("model".to_string(), json!(self.model.model_id));
        body.insert("messages".to_string(), json!(conversation));
        body.insert("max_tokens".to_string(), json!(self.output_token_limit()));
        body.insert("stream".to_string(), json!(true));
        if let Some(system) = join_system(messages) {
            body.insert("system".to_string(), json!(system));
        }

        // Penalties are not part of this API. Sampling is rejected alongside
        // extended thinking.
        let mut sampling = GenerationArgs {
            presence_penalty: None,
            frequency_penalty: None,
            ..*base
        };
        if thinking_enabled {
            sampling.temperature = None;
            sampling.top_p = None;
        }
        sampling.write_into(&mut body);

        if let Some(thinking) = thinking {
            body.insert("thinking".to_string(), json!(thinking));
        }
        merge_body(&mut body, self.model.enabled_body());

        ProviderArgs {
            model: self.model.model_id.clone(),
            headers: self.headers(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Value;

    use super::*;
    use crate::args::thinking::ThinkingMatrix;
    use crate::dispatch::Role;
    use crate::model::{ModelConfig, ThinkingLevel};

    fn claude(model_id: &str, level: ThinkingLevel) -> ModelConfig {
        let mut model = ModelConfig {
            model_id: model_id.into(),
            ..Default::default()
        };
        model.thinking.level = level;
        model.generation.temperature = 0.7;
        model.generation.temperature_custom_enable = true;
        model.generation.top_p = 0.9;
        model.generation.top_p_custom_enable = true;
        model.generation.presence_penalty_custom_enable = true;
        model.generation.frequency_penalty_custom_enable = true;
        model
    }

    fn has_enabled_thinking(body: &Map<String, Value>) -> bool {
        body.get("thinking")
            .and_then(|t| t.get("type"))
            .is_some_and(|t| t == "enabled")
    }

    fn build(model: &ModelConfig) -> ProviderArgs {
        let matrix = ThinkingMatrix::builtin();
        let headers = BTreeMap::new();
        let messages = [
            ChatMessage::new(Role::System, "s1"),
            ChatMessage::new(Role::User, "q"),
            ChatMessage::new(Role::System, "s2"),
        ];
        ArgsBuilder::new(model, &matrix, &headers)
            .anthropic(&messages, &GenerationArgs::from_settings(&model.generation))
    }

    #[test]
    fn thinking_drops_sampling() {
        for level in [ThinkingLevel::Low, ThinkingLevel::Medium, ThinkingLevel::High] {
            let args = build(&claude("claude-sonnet-4-0", level));
            assert!(args.get("temperature").is_none(), "{level:?}");
            assert!(args.get("top_p").is_none(), "{level:?}");
            assert!(has_enabled_thinking(&args.body));
        }
    }

    #[test]
    fn off_keeps_sampling_and_disables_thinking() {
        let args = build(&claude("claude-opus-4-1", ThinkingLevel::Off));
        assert_eq!(args.get("temperature"), Some(&json!(0.7)));
        assert_eq!(args.get("top_p"), Some(&json!(0.9)));
        assert_eq!(args.get("thinking"), Some(&json!({"type": "disabled"})));
    }

    #[test]
    fn unrecognized_family_still_never_mixes_sampling_with_thinking() {
        let args = build(&claude("claude-3-5-sonnet", ThinkingLevel::High));
        assert!(args.get("temperature").is_none());
        assert_eq!(
            args.get("thinking"),
            Some(&json!({"type": "enabled", "budget_tokens": 2048}))
        );

        let off = build(&claude("claude-3-5-sonnet", ThinkingLevel::Off));
        assert!(off.get("thinking").is_none());
        assert_eq!(off.get("temperature"), Some(&json!(0.7)));
    }

    #[test]
    fn penalties_never_sent() {
        let args = build(&claude("claude-opus-4-1", ThinkingLevel::Off));
        assert!(args.get("presence_penalty").is_none());
        assert!(args.get("frequency_penalty").is_none());
    }

    #[test]
    fn system_split_out_of_messages() {
        let args = build(&claude("claude-opus-4-1", ThinkingLevel::Off));
        assert_eq!(args.get("system"), Some(&json!("s1\n\ns2")));
        assert_eq!(
            args.get("messages"),
            Some(&json!([{"role": "user", "content": "q"}]))
        );
        assert_eq!(args.get("stream"), Some(&json!(true)));
        assert_eq!(args.get("max_tokens"), Some(&json!(4096)));
    }
}
