use serde_json::{Map, Value, json};

use super::{ArgsBuilder, GenerationArgs, ProviderArgs, join_system, merge_body};
use crate::dispatch::{ChatMessage, Role};

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn camel_case(name: &'static str) -> &'static str {
    match name {
        "top_p" => "topP",
        "presence_penalty" => "presencePenalty",
        "frequency_penalty" => "frequencyPenalty",
        other => other,
    }
}

impl ArgsBuilder<'_> {
    pub fn google(&self, messages: &[ChatMessage], base: &GenerationArgs) -> ProviderArgs {
        // Only user turns go into contents; system text rides in systemInstruction.
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role == Role::User && !m.content.is_empty())
            .map(|m| json!({ "role": "user", "parts": [{ "text": m.content }] }))
            .collect();

        let mut config = Map::new();
        for (name, value) in base.entries() {
            config.insert(camel_case(name).to_string(), Value::from(value));
        }
        config.insert(
            "maxOutputTokens".to_string(),
            json!(self.output_token_limit()),
        );
        if let Some(thinking) = self
            .matrix
            .google(&self.model.model_id, self.model.thinking_level())
        {
            config.insert("thinkingConfig".to_string(), thinking.to_config());
        }
        merge_body(&mut config, self.model.enabled_body());

        let safety: Vec<Value> = HARM_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect();

        let mut body = Map::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if let Some(system) = join_system(messages) {
            body.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }
        body.insert("generationConfig".to_string(), Value::Object(config));
        body.insert("safetySettings".to_string(), Value::Array(safety));

        ProviderArgs {
            model: self.model.model_id.clone(),
            headers: self.headers(),
            body,
        }
    }
}
