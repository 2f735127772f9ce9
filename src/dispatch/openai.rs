//! OpenAI-compatible chat/completions streaming (also used for SakuraLLM).

use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::args::ProviderArgs;
use crate::degradation::DegradationDetector;
use crate::dispatch::client_pool::ProviderClient;
use crate::dispatch::{decode_event, skip_malformed};
use crate::error::RequestError;
use crate::stream::{
    StreamOutput, StreamSession, StreamStrategy, normalize_line_breaks, usage_count,
};

const PROVIDER: &str = "OpenAI";
const DONE_MARKER: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Vec<ChoiceWire>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: DeltaWire,
}

#[derive(Deserialize, Default)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenAiEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    Usage(Value),
    Done,
}

/// The assembled message, built up as events pass through the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    /// `Some` once the endpoint sent a dedicated reasoning field.
    pub reasoning_content: Option<String>,
    pub usage: Option<Value>,
}

impl ChatCompletion {
    fn absorb(&mut self, event: &OpenAiEvent) {
        match event {
            OpenAiEvent::ContentDelta(text) => self.content.push_str(text),
            OpenAiEvent::ReasoningDelta(text) => self
                .reasoning_content
                .get_or_insert_with(String::new)
                .push_str(text),
            OpenAiEvent::Usage(usage) => self.usage = Some(usage.clone()),
            OpenAiEvent::Done => {}
        }
    }
}

/// Decode one SSE payload into zero or more events.
pub fn decode_chunk(data: &str) -> Result<Vec<OpenAiEvent>, RequestError> {
    let data = data.trim();
    if data == DONE_MARKER {
        return Ok(vec![OpenAiEvent::Done]);
    }
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let chunk: ChunkWire = decode_event(PROVIDER, data)?;
    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RequestError::Upstream {
            provider: PROVIDER.to_string(),
            message,
            status: None,
        });
    }

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(reasoning) = choice.delta.reasoning_content {
            events.push(OpenAiEvent::ReasoningDelta(reasoning));
        }
        if let Some(content) = choice.delta.content {
            events.push(OpenAiEvent::ContentDelta(content));
        }
    }
    if let Some(usage) = chunk.usage.filter(|u| !u.is_null()) {
        events.push(OpenAiEvent::Usage(usage));
    }
    Ok(events)
}

/// Split a final message into `(reasoning, result)`.
///
/// A dedicated reasoning field wins; otherwise a `<think>...</think>` wrapper
/// in the content is split off; otherwise everything is result.
pub fn extract_openai_think_and_result(message: &ChatCompletion) -> (String, String) {
    if let Some(reasoning) = &message.reasoning_content {
        return (
            normalize_line_breaks(reasoning),
            message.content.trim().to_string(),
        );
    }

    let content = message.content.as_str();
    if let (Some((head, _)), Some((_, tail))) = (
        content.split_once("</think>"),
        content.rsplit_once("</think>"),
    ) {
        let head = head.trim();
        let think = head.strip_prefix("<think>").unwrap_or(head);
        return (normalize_line_breaks(think), tail.trim().to_string());
    }

    (String::new(), content.trim().to_string())
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct OpenAiState {
    pub detector: DegradationDetector,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiStrategy;

impl StreamStrategy for OpenAiStrategy {
    type Event = OpenAiEvent;
    type Aggregate = ChatCompletion;
    type State = OpenAiState;

    fn create_state(&self) -> OpenAiState {
        OpenAiState::default()
    }

    async fn build_stream_session(
        &self,
        client: &ProviderClient,
        args: &ProviderArgs,
    ) -> Result<StreamSession<OpenAiEvent, ChatCompletion>, RequestError> {
        let events = client.open_events(args).await?;

        let snapshot = Arc::new(Mutex::new(ChatCompletion::default()));
        let sink = snapshot.clone();
        let decoded = events.flat_map(move |item| {
            let decoded = skip_malformed(PROVIDER, item.and_then(|e| decode_chunk(&e.data)));
            let batch: Vec<Result<OpenAiEvent, RequestError>> = match decoded {
                None => Vec::new(),
                Some(Ok(events)) => {
                    let mut message = sink.lock().unwrap_or_else(|e| e.into_inner());
                    events
                        .into_iter()
                        .inspect(|event| message.absorb(event))
                        .map(Ok)
                        .collect()
                }
                Some(Err(e)) => vec![Err(e)],
            };
            stream::iter(batch)
        });

        let session = StreamSession::abortable(decoded, || {
            tracing::debug!(provider = PROVIDER, "stream closed");
            Ok(())
        })
        .with_finalize(move || Ok(snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()));
        Ok(session)
    }

    fn handle_item(&self, state: &mut OpenAiState, item: OpenAiEvent) -> Result<(), RequestError> {
        let OpenAiEvent::ContentDelta(text) = item else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }
        if state.detector.feed(&text) {
            tracing::warn!(provider = PROVIDER, "degradation detected mid-stream");
            return Err(RequestError::Degraded);
        }
        Ok(())
    }

    fn finalize(
        &self,
        session: &mut StreamSession<OpenAiEvent, ChatCompletion>,
        _state: OpenAiState,
    ) -> Result<StreamOutput, RequestError> {
        let finalize = session.take_finalize().ok_or_else(|| {
            RequestError::Contract("OpenAI stream session missing finalize".to_string())
        })?;
        let message = finalize()?;

        let (reasoning, result) = extract_openai_think_and_result(&message);
        if DegradationDetector::has_output_degradation(&result) {
            tracing::warn!(provider = PROVIDER, "degradation detected in final output");
            return Err(RequestError::Degraded);
        }

        let usage = message.usage.as_ref();
        Ok(StreamOutput {
            reasoning,
            result,
            input_tokens: usage_count(usage, "prompt_tokens"),
            output_tokens: usage_count(usage, "completion_tokens"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn message(content: &str, reasoning: Option<&str>) -> ChatCompletion {
        ChatCompletion {
            content: content.to_string(),
            reasoning_content: reasoning.map(str::to_string),
            usage: None,
        }
    }

    #[test]
    fn reasoning_field_wins() {
        let (think, result) = extract_openai_think_and_result(&message("R", Some("A\n\nB")));
        assert_eq!(think, "A\nB");
        assert_eq!(result, "R");
    }

    #[test]
    fn think_tags_are_split() {
        let (think, result) =
            extract_openai_think_and_result(&message("<think> T1\n\nT2</think> OUT", None));
        assert_eq!(think, "T1\nT2");
        assert_eq!(result, "OUT");
    }

    #[test]
    fn plain_content_is_result() {
        let (think, result) = extract_openai_think_and_result(&message("  hello \n", None));
        assert_eq!(think, "");
        assert_eq!(result, "hello");
    }

    #[test]
    fn decode_splits_reasoning_content_and_usage() {
        let events = decode_chunk(
            r#"{"choices":[{"delta":{"reasoning_content":"r","content":"c"}}],"usage":{"prompt_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                OpenAiEvent::ReasoningDelta("r".into()),
                OpenAiEvent::ContentDelta("c".into()),
                OpenAiEvent::Usage(json!({"prompt_tokens": 1})),
            ]
        );
        assert_eq!(decode_chunk("[DONE]").unwrap(), vec![OpenAiEvent::Done]);
        assert!(decode_chunk(r#"{"choices":[]}"#).unwrap().is_empty());
        assert!(decode_chunk(r#"{"choices":[{"delta":{}}],"usage":null}"#).unwrap().is_empty());
    }

    #[test]
    fn decode_error_payload_is_upstream() {
        let err = decode_chunk(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(matches!(err, RequestError::Upstream { status: None, ref message, .. } if message == "overloaded"));
        assert!(skip_malformed(PROVIDER, Err::<(), _>(err)).is_some());
    }

    #[test]
    fn bad_frame_between_good_frames_is_dropped() {
        let frames = [
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ];
        let text: String = frames
            .iter()
            .filter_map(|data| skip_malformed(PROVIDER, decode_chunk(data)))
            .flat_map(|batch| batch.unwrap())
            .filter_map(|event| match event {
                OpenAiEvent::ContentDelta(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn handle_item_ignores_non_content() {
        let strategy = OpenAiStrategy;
        let mut state = strategy.create_state();
        // Repetitive reasoning never reaches the detector.
        strategy
            .handle_item(&mut state, OpenAiEvent::ReasoningDelta("x".repeat(100)))
            .unwrap();
        strategy.handle_item(&mut state, OpenAiEvent::Done).unwrap();
        strategy
            .handle_item(&mut state, OpenAiEvent::ContentDelta("ok".into()))
            .unwrap();
        strategy
            .handle_item(&mut state, OpenAiEvent::ContentDelta("x".repeat(10)))
            .unwrap();
        assert!(!state.detector.is_degraded());
    }

    #[test]
    fn handle_item_raises_degradation() {
        let strategy = OpenAiStrategy;
        let mut state = strategy.create_state();
        let err = strategy
            .handle_item(&mut state, OpenAiEvent::ContentDelta("A".repeat(50)))
            .unwrap_err();
        assert!(matches!(err, RequestError::Degraded));
    }

    #[test]
    fn finalize_without_callable_is_contract_error() {
        let strategy = OpenAiStrategy;
        let mut session: StreamSession<OpenAiEvent, ChatCompletion> =
            StreamSession::new(stream::empty(), crate::stream::SessionCloser::noop());
        let err = strategy
            .finalize(&mut session, strategy.create_state())
            .unwrap_err();
        assert!(err.to_string().contains("missing finalize"));
    }

    #[test]
    fn finalize_reads_usage_and_checks_degradation() {
        let strategy = OpenAiStrategy;
        let mut session: StreamSession<OpenAiEvent, ChatCompletion> =
            StreamSession::new(stream::empty(), crate::stream::SessionCloser::noop())
                .with_finalize(|| {
                    Ok(ChatCompletion {
                        content: "done".into(),
                        reasoning_content: None,
                        usage: Some(json!({"prompt_tokens": 12, "completion_tokens": "x"})),
                    })
                });
        let out = strategy.finalize(&mut session, strategy.create_state()).unwrap();
        assert_eq!(out.result, "done");
        assert_eq!(out.input_tokens, 12);
        assert_eq!(out.output_tokens, 0);

        let mut degraded: StreamSession<OpenAiEvent, ChatCompletion> =
            StreamSession::new(stream::empty(), crate::stream::SessionCloser::noop())
                .with_finalize(|| Ok(message(&"ab".repeat(40), None)));
        assert!(matches!(
            strategy.finalize(&mut degraded, strategy.create_state()),
            Err(RequestError::Degraded)
        ));
    }
}
