//! API key tester: sends a fixed test prompt through every key of one model.

use std::time::Instant;

use serde::Serialize;

use crate::config::Config;
use crate::dispatch::client_pool::NO_KEY_REQUIRED;
use crate::dispatch::{ChatMessage, Role};
use crate::engine::{Engine, EngineStatus};
use crate::error::{ErrorKind, RequestError};
use crate::model::{ApiFormat, ModelConfig};
use crate::requester::{Services, TaskRequester};

const SAKURA_SYSTEM_PROMPT: &str = "你是一个轻小说翻译模型，可以流畅通顺地以日本轻小说的风格将日文翻译成简体中文，并联系上下文正确使用人称代词，不擅自添加原文中没有的代词。";
const SAKURA_USER_PROMPT: &str = "将下面的日文文本翻译成中文：魔導具師ダリヤはうつむかない";
const JSON_LINE_PROMPT: &str =
    r#"将下面的日文文本翻译成中文，按输入格式返回结果：{"0":"魔導具師ダリヤはうつむかない"}"#;

/// Characters kept visible at each end of a masked key.
const MASK_KEEP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyTestResult {
    pub masked_key: String,
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_time_ms: u64,
    /// Empty on success.
    pub error_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiTestResult {
    pub success: bool,
    pub result_msg: String,
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_response_time_ms: u64,
    pub key_results: Vec<KeyTestResult>,
}

#[derive(Debug, thiserror::Error)]
pub enum TesterError {
    #[error("another task is running")]
    Busy,
}

/// Test prompt for `format`.
pub fn test_messages(format: ApiFormat) -> Vec<ChatMessage> {
    match format {
        ApiFormat::Sakura => vec![
            ChatMessage::new(Role::System, SAKURA_SYSTEM_PROMPT),
            ChatMessage::new(Role::User, SAKURA_USER_PROMPT),
        ],
        _ => vec![ChatMessage::new(Role::User, JSON_LINE_PROMPT)],
    }
}

/// Keep the first and last 8 characters, star out the middle. Short keys are
/// fully masked.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= MASK_KEEP * 2 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..MASK_KEEP].iter().collect();
    let tail: String = chars[chars.len() - MASK_KEEP..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - MASK_KEEP * 2))
}

fn failure_reason(error: &RequestError, config: &Config) -> String {
    if error.kind() == ErrorKind::Timeout {
        return format!("timed out after {} seconds", config.request_timeout_secs);
    }
    error.user_message()
}

pub struct ApiTester<'a> {
    config: &'a Config,
    engine: &'a Engine,
    services: Services,
}

impl<'a> ApiTester<'a> {
    pub fn new(config: &'a Config, engine: &'a Engine, services: Services) -> Self {
        Self {
            config,
            engine,
            services,
        }
    }

    /// Test every key of `model` in order. The engine must be IDLE; it is
    /// held in TESTING for the duration and released afterwards.
    pub async fn run(&self, model: &ModelConfig) -> Result<ApiTestResult, TesterError> {
        if !self.engine.try_occupy(EngineStatus::Testing) {
            tracing::warn!("api test refused: engine is {:?}", self.engine.status());
            return Err(TesterError::Busy);
        }
        let _idle = IdleOnDrop(self.engine);
        Ok(self.run_keys(model).await)
    }

    async fn run_keys(&self, model: &ModelConfig) -> ApiTestResult {
        let mut keys = model.api_keys();
        if keys.is_empty() {
            keys.push(NO_KEY_REQUIRED.to_string());
        }
        let messages = test_messages(model.api_format);
        self.services.pool.reset();

        let mut key_results = Vec::with_capacity(keys.len());
        for key in &keys {
            let single = ModelConfig {
                api_key: key.clone(),
                ..model.clone()
            };
            let requester = TaskRequester::new(self.config, single, self.services.clone());

            tracing::info!(model = %model.id, key = %mask_key(key), "testing key");
            let started = Instant::now();
            let outcome = requester.request(&messages, None).await;
            let response_time_ms = started.elapsed().as_millis() as u64;

            let key_result = match &outcome.error {
                Some(e) => {
                    let reason = failure_reason(e, self.config);
                    tracing::warn!(key = %mask_key(key), "api test failed: {reason}");
                    KeyTestResult {
                        masked_key: mask_key(key),
                        success: false,
                        input_tokens: 0,
                        output_tokens: 0,
                        response_time_ms,
                        error_reason: reason,
                    }
                }
                None => {
                    if !outcome.reasoning.is_empty() {
                        tracing::info!("reasoning:\n{}", outcome.reasoning);
                    }
                    tracing::info!("result:\n{}", outcome.result);
                    KeyTestResult {
                        masked_key: mask_key(key),
                        success: true,
                        input_tokens: outcome.input_tokens,
                        output_tokens: outcome.output_tokens,
                        response_time_ms,
                        error_reason: String::new(),
                    }
                }
            };
            key_results.push(key_result);
        }

        summarize(key_results)
    }
}

/// Returns the engine to IDLE however the test run ends.
struct IdleOnDrop<'a>(&'a Engine);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set_status(EngineStatus::Idle);
    }
}

fn summarize(key_results: Vec<KeyTestResult>) -> ApiTestResult {
    let total_count = key_results.len();
    let success_count = key_results.iter().filter(|r| r.success).count();
    let failure_count = total_count - success_count;
    let total_response_time_ms = key_results.iter().map(|r| r.response_time_ms).sum();
    let result_msg = format!(
        "tested {total_count} key(s): {success_count} succeeded, {failure_count} failed"
    );
    tracing::info!("{result_msg}");

    ApiTestResult {
        success: failure_count == 0,
        result_msg,
        total_count,
        success_count,
        failure_count,
        total_response_time_ms,
        key_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_keep_eight_each_side() {
        let key = "sk-abcdefghijklmnopqrstuvwxyz";
        let masked = mask_key(key);
        assert_eq!(masked.len(), key.len());
        assert!(masked.starts_with("sk-abcde"));
        assert!(masked.ends_with("stuvwxyz"));
        assert_eq!(masked.matches('*').count(), key.len() - 16);
    }

    #[test]
    fn short_keys_fully_masked() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(&"k".repeat(16)), "*".repeat(16));
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn test_prompt_depends_on_format() {
        let sakura = test_messages(ApiFormat::Sakura);
        assert_eq!(sakura.len(), 2);
        assert!(sakura[0].is_system());

        let other = test_messages(ApiFormat::Google);
        assert_eq!(other.len(), 1);
        assert!(other[0].content.contains(r#"{"0":"#));
    }

    #[test]
    fn timeout_reason_names_seconds() {
        let config = Config {
            request_timeout_secs: 42,
            ..Default::default()
        };
        assert_eq!(
            failure_reason(&RequestError::HardTimeout, &config),
            "timed out after 42 seconds"
        );
        assert_eq!(
            failure_reason(&RequestError::Degraded, &config),
            "model output degraded into repetition"
        );
        let upstream = RequestError::Upstream {
            provider: "OpenAI".into(),
            message: "500: stack trace with https://internal".into(),
            status: Some(500),
        };
        assert_eq!(
            failure_reason(&upstream, &config),
            "upstream error from OpenAI (HTTP 500)"
        );
    }

    #[test]
    fn summary_counts() {
        let ok = KeyTestResult {
            masked_key: "*".into(),
            success: true,
            input_tokens: 1,
            output_tokens: 1,
            response_time_ms: 10,
            error_reason: String::new(),
        };
        let bad = KeyTestResult {
            success: false,
            response_time_ms: 5,
            error_reason: "x".into(),
            ..ok.clone()
        };
        let summary = summarize(vec![ok, bad]);
        assert!(!summary.success);
        assert_eq!((summary.success_count, summary.failure_count), (1, 1));
        assert_eq!(summary.total_response_time_ms, 15);
    }
}
