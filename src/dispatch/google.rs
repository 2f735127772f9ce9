//! Google Generative Language `streamGenerateContent` (SSE mode).

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

const PROVIDER: &str = "Google";

// Every level of the chunk is optional on the wire.

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ChunkWire {
    #[serde(default)]
    candidates: Vec<CandidateWire>,
    #[serde(default)]
    usage_metadata: Option<Value>,
}

#[derive(Deserialize, Default)]
struct CandidateWire {
    #[serde(default)]
    content: Option<ContentWire>,
}

#[derive(Deserialize, Default)]
struct ContentWire {
    #[serde(default)]
    parts: Vec<PartWire>,
}

#[derive(Deserialize, Default)]
struct PartWire {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GoogleEvent {
    Thought(String),
    Text(String),
    Usage(Value),
}

/// Flatten one streamed chunk into part-level events.
pub fn decode_chunk(data: &str) -> Result<Vec<GoogleEvent>, RequestError> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let chunk: ChunkWire = decode_event(PROVIDER, data)?;

    let mut events: Vec<GoogleEvent> = chunk
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| {
            let text = part.text?;
            Some(if part.thought {
                GoogleEvent::Thought(text)
            } else {
                GoogleEvent::Text(text)
            })
        })
        .collect();
    if let Some(usage) = chunk.usage_metadata.filter(|u| !u.is_null()) {
        events.push(GoogleEvent::Usage(usage));
    }
    Ok(events)
}

#[derive(Debug, Default)]
pub struct GoogleState {
    pub detector: DegradationDetector,
    pub reasoning: String,
    pub result: String,
    pub usage: Option<Value>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleStrategy;

impl StreamStrategy for GoogleStrategy {
    type Event = GoogleEvent;
    /// Google has no provider-side final message; the state is authoritative.
    type Aggregate = ();
    type State = GoogleState;

    fn create_state(&self) -> GoogleState {
        GoogleState::default()
    }

    async fn build_stream_session(
        &self,
        client: &ProviderClient,
        args: &ProviderArgs,
    ) -> Result<StreamSession<GoogleEvent, ()>, RequestError> {
        let events = client.open_events(args).await?;
        let decoded = events.flat_map(|item| {
            let decoded = skip_malformed(PROVIDER, item.and_then(|e| decode_chunk(&e.data)));
            let batch: Vec<Result<GoogleEvent, RequestError>> = match decoded {
                None => Vec::new(),
                Some(Ok(events)) => events.into_iter().map(Ok).collect(),
                Some(Err(e)) => vec![Err(e)],
            };
            stream::iter(batch)
        });

        Ok(StreamSession::abortable(decoded, || {
            tracing::debug!(provider = PROVIDER, "stream closed");
            Ok(())
        }))
    }

    fn handle_item(&self, state: &mut GoogleState, item: GoogleEvent) -> Result<(), RequestError> {
        match item {
            GoogleEvent::Thought(text) => state.reasoning.push_str(&text),
            GoogleEvent::Text(text) => {
                state.result.push_str(&text);
                if state.detector.feed(&text) {
                    tracing::warn!(provider = PROVIDER, "degradation detected mid-stream");
                    return Err(RequestError::Degraded);
                }
            }
            GoogleEvent::Usage(usage) => state.usage = Some(usage),
        }
        Ok(())
    }

    fn finalize(
        &self,
        _session: &mut StreamSession<GoogleEvent, ()>,
        state: GoogleState,
    ) -> Result<StreamOutput, RequestError> {
        let result = state.result.trim().to_string();
        if DegradationDetector::has_output_degradation(&result) {
            tracing::warn!(provider = PROVIDER, "degradation detected in final output");
            return Err(RequestError::Degraded);
        }

        let usage = state.usage.as_ref();
        let input_tokens = usage_count(usage, "promptTokenCount");
        let total_tokens = usage_count(usage, "totalTokenCount");
        Ok(StreamOutput {
            reasoning: normalize_line_breaks(&state.reasoning),
            result,
            input_tokens,
            output_tokens: total_tokens.saturating_sub(input_tokens),
        })
    }
}
