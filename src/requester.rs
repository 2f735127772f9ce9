//! Per-model request orchestration.
//!
//! [`TaskRequester::request`] is the single entry point the scheduler calls:
//! it routes by API format, drives the provider stream, and folds every
//! outcome into one [`RequestOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::args::thinking::ThinkingMatrix;
use crate::args::{ArgsBuilder, GenerationArgs, ProviderArgs};
use crate::config::Config;
use crate::dispatch::ChatMessage;
use crate::dispatch::anthropic::AnthropicStrategy;
use crate::dispatch::client_pool::{ClientPool, ProviderClient};
use crate::dispatch::google::GoogleStrategy;
use crate::dispatch::openai::OpenAiStrategy;
use crate::engine::RequestTracker;
use crate::error::{ErrorKind, RequestError};
use crate::model::{ApiFormat, ModelConfig};
use crate::stream::{StopChecker, StreamConsumer, StreamControl, StreamOutput, StreamStrategy};

/// Uniform result of one request: an error or none, plus whatever text and
/// token counts were produced. Failed requests carry empty text and zeros.
#[derive(Debug, Default)]
pub struct RequestOutcome {
    pub error: Option<RequestError>,
    pub reasoning: String,
    pub result: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RequestOutcome {
    pub fn failed(error: RequestError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(RequestError::kind)
    }

    pub fn into_result(self) -> Result<StreamOutput, RequestError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(StreamOutput {
                reasoning: self.reasoning,
                result: self.result,
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            }),
        }
    }
}

impl From<Result<StreamOutput, RequestError>> for RequestOutcome {
    fn from(result: Result<StreamOutput, RequestError>) -> Self {
        match result {
            Ok(output) => Self {
                error: None,
                reasoning: output.reasoning,
                result: output.result,
                input_tokens: output.input_tokens,
                output_tokens: output.output_tokens,
            },
            Err(e) => Self::failed(e),
        }
    }
}

/// Shared collaborators injected into every requester.
#[derive(Clone)]
pub struct Services {
    pub pool: Arc<ClientPool>,
    pub tracker: Arc<dyn RequestTracker>,
    pub matrix: Arc<ThinkingMatrix>,
}

/// Decrements the in-flight counter on drop, so an aborted or panicking
/// request still balances its increment.
struct InFlightGuard<'a> {
    tracker: &'a dyn RequestTracker,
}

impl<'a> InFlightGuard<'a> {
    fn enter(tracker: &'a dyn RequestTracker) -> Self {
        tracker.inc_request_in_flight();
        Self { tracker }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.dec_request_in_flight();
    }
}

pub struct TaskRequester {
    model: ModelConfig,
    api_keys: Vec<String>,
    request_timeout: Duration,
    services: Services,
}

impl TaskRequester {
    pub fn new(config: &Config, model: ModelConfig, services: Services) -> Self {
        let api_keys = model.api_keys();
        Self {
            model,
            api_keys,
            request_timeout: config.request_timeout(),
            services,
        }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send `messages` and wait for the full response.
    ///
    /// A stop already requested is reported without touching the in-flight
    /// counter. Otherwise the counter is held for exactly the duration of the
    /// dispatch.
    pub async fn request(
        &self,
        messages: &[ChatMessage],
        stop_checker: Option<StopChecker>,
    ) -> RequestOutcome {
        let control = StreamControl::new(stop_checker, Some(Instant::now() + self.request_timeout));
        if control.is_stop_requested() {
            return RequestOutcome::failed(RequestError::Cancelled);
        }

        let result = {
            let _in_flight = InFlightGuard::enter(self.services.tracker.as_ref());
            let base = GenerationArgs::from_settings(&self.model.generation);
            match self.model.api_format {
                ApiFormat::Sakura => self.request_sakura(messages, &base, &control).await,
                ApiFormat::Google => self.request_google(messages, &base, &control).await,
                ApiFormat::Anthropic => self.request_anthropic(messages, &base, &control).await,
                ApiFormat::OpenAi => self.request_openai(messages, &base, &control).await,
            }
        };

        if let Err(e) = &result
            && e.kind() == ErrorKind::Generic
        {
            tracing::warn!(
                model = %self.model.id,
                format = %self.model.api_format,
                provider = e.provider().unwrap_or_default(),
                retryable = e.is_retryable(),
                "request failed: {e:?}"
            );
        }
        result.into()
    }

    pub async fn request_openai(
        &self,
        messages: &[ChatMessage],
        base: &GenerationArgs,
        control: &StreamControl,
    ) -> Result<StreamOutput, RequestError> {
        if control.is_stop_requested() {
            return Err(RequestError::Cancelled);
        }
        let client = self.client(&[])?;
        let args = self.args_builder().openai(messages, base);
        self.request_stream_with_strategy(&OpenAiStrategy, &client, &args, control)
            .await
    }

    /// OpenAI wire format; the result lines are re-keyed by index into a
    /// JSON object so the line-oriented model looks like the others.
    pub async fn request_sakura(
        &self,
        messages: &[ChatMessage],
        base: &GenerationArgs,
        control: &StreamControl,
    ) -> Result<StreamOutput, RequestError> {
        if control.is_stop_requested() {
            return Err(RequestError::Cancelled);
        }
        let client = self.client(&[])?;
        let args = self.args_builder().sakura(messages, base);
        let mut output = self
            .request_stream_with_strategy(&OpenAiStrategy, &client, &args, control)
            .await?;
        output.result = lines_to_indexed_json(&output.result);
        Ok(output)
    }

    pub async fn request_google(
        &self,
        messages: &[ChatMessage],
        base: &GenerationArgs,
        control: &StreamControl,
    ) -> Result<StreamOutput, RequestError> {
        if control.is_stop_requested() {
            return Err(RequestError::Cancelled);
        }
        // BTreeMap iteration is already sorted by header name.
        let headers: Vec<(String, String)> = self.model.enabled_headers().into_iter().collect();
        let client = self.client(&headers)?;
        let args = self.args_builder().google(messages, base);
        self.request_stream_with_strategy(&GoogleStrategy, &client, &args, control)
            .await
    }

    pub async fn request_anthropic(
        &self,
        messages: &[ChatMessage],
        base: &GenerationArgs,
        control: &StreamControl,
    ) -> Result<StreamOutput, RequestError> {
        if control.is_stop_requested() {
            return Err(RequestError::Cancelled);
        }
        let client = self.client(&[])?;
        let args = self.args_builder().anthropic(messages, base);
        self.request_stream_with_strategy(&AnthropicStrategy, &client, &args, control)
            .await
    }

    /// Drive one strategy through its lifecycle.
    pub async fn request_stream_with_strategy<S: StreamStrategy>(
        &self,
        strategy: &S,
        client: &ProviderClient,
        args: &ProviderArgs,
        control: &StreamControl,
    ) -> Result<StreamOutput, RequestError> {
        let mut state = strategy.create_state();
        let mut session = strategy.build_stream_session(client, args).await?;
        StreamConsumer::consume(&mut session, control, |item| {
            strategy.handle_item(&mut state, item)
        })
        .await?;
        strategy.finalize(&mut session, state)
    }

    fn args_builder(&self) -> ArgsBuilder<'_> {
        ArgsBuilder::new(
            &self.model,
            &self.services.matrix,
            self.services.pool.default_headers(),
        )
    }

    fn client(&self, extra_headers: &[(String, String)]) -> Result<Arc<ProviderClient>, RequestError> {
        let pool = &self.services.pool;
        pool.get_client(
            &self.model.api_url,
            &pool.next_key(&self.api_keys),
            self.model.api_format,
            self.request_timeout,
            extra_headers,
        )
    }
}

/// Line boundaries recognised when indexing Sakura output: `\n`, `\r`, and
/// the vertical-tab, form-feed, separator and NEL code points.
fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// `"a\n b "` → `{"0":"a","1":"b"}`.
pub fn lines_to_indexed_json(text: &str) -> String {
    let text = text
        .trim_matches(|c: char| c.is_whitespace() || is_line_break(c))
        .replace("\r\n", "\n");
    if text.is_empty() {
        return "{}".to_string();
    }
    let map: Map<String, Value> = text
        .split(is_line_break)
        .enumerate()
        .map(|(i, line)| (i.to_string(), Value::String(line.trim().to_string())))
        .collect();
    Value::Object(map).to_string()
}
