use serde_json::{Map, Value, json};

use super::{ArgsBuilder, GenerationArgs, ProviderArgs, merge_body};
use crate::dispatch::ChatMessage;

/// Hosts that only accept the newer token-limit field.
const MAX_COMPLETION_TOKENS_HOSTS: &[&str] = &["https://api.openai.com"];

pub fn uses_max_completion_tokens(api_url: &str) -> bool {
    MAX_COMPLETION_TOKENS_HOSTS
        .iter()
        .any(|host| api_url.starts_with(host))
}

impl ArgsBuilder<'_> {
    pub fn openai(&self, messages: &[ChatMessage], base: &GenerationArgs) -> ProviderArgs {
        let mut body = self.chat_body(messages, base);
        if let Some(thinking) = self
            .matrix
            .openai(&self.model.model_id, self.model.thinking_level())
        {
            thinking.apply(&mut body);
        }
        self.finish_chat(body)
    }

    /// Same wire format as OpenAI, without thinking arguments.
    pub fn sakura(&self, messages: &[ChatMessage], base: &GenerationArgs) -> ProviderArgs {
        let body = self.chat_body(messages, base);
        self.finish_chat(body)
    }

    fn chat_body(&self, messages: &[ChatMessage], base: &GenerationArgs) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(self.model.model_id));
        body.insert("messages".to_string(), json!(messages));
        body.insert("stream".to_string(), json!(true));
        body.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );

        let limit_key = if uses_max_completion_tokens(&self.model.api_url) {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        body.insert(limit_key.to_string(), json!(self.output_token_limit()));
        base.write_into(&mut body);
        body
    }

    fn finish_chat(&self, mut body: Map<String, Value>) -> ProviderArgs {
        merge_body(&mut body, self.model.enabled_body());
        ProviderArgs {
            model: self.model.model_id.clone(),
            headers: self.headers(),
            body,
        }
    }
}
