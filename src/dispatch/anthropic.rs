//! Anthropic Messages API streaming.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use futures_util::stream::StreamExt;
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

const PROVIDER: &str = "Anthropic";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Value>,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

/// Decode one SSE payload. Stream-level `error` events become errors here.
pub fn decode(data: &str) -> Result<AnthropicEvent, RequestError> {
    let event: AnthropicEvent = decode_event(PROVIDER, data)?;
    if let AnthropicEvent::Error { error } = &event {
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
    Ok(event)
}

// ---------------------------------------------------------------------------
// Final message
// ---------------------------------------------------------------------------

/// Message assembled from the event stream, block by block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnthropicMessage {
    pub content: Vec<ContentBlock>,
    pub usage: serde_json::Map<String, Value>,
}

impl AnthropicMessage {
    fn absorb(&mut self, event: &AnthropicEvent) {
        match event {
            AnthropicEvent::MessageStart { message } => {
                self.merge_usage(message.usage.as_ref());
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                // Blocks arrive in order; only overwrite or append.
                match self.content.len().cmp(index) {
                    Ordering::Greater => self.content[*index] = content_block.clone(),
                    Ordering::Equal => self.content.push(content_block.clone()),
                    Ordering::Less => {
                        tracing::debug!(
                            provider = PROVIDER,
                            index,
                            blocks = self.content.len(),
                            "ignoring out-of-order content block"
                        );
                    }
                }
            }
            AnthropicEvent::ContentBlockDelta { index, delta } => {
                match (self.content.get_mut(*index), delta) {
                    (Some(ContentBlock::Text { text }), BlockDelta::TextDelta { text: more }) => {
                        text.push_str(more)
                    }
                    (
                        Some(ContentBlock::Thinking { thinking }),
                        BlockDelta::ThinkingDelta { thinking: more },
                    ) => thinking.push_str(more),
                    _ => {}
                }
            }
            AnthropicEvent::MessageDelta { usage } => self.merge_usage(usage.as_ref()),
            _ => {}
        }
    }

    fn merge_usage(&mut self, usage: Option<&Value>) {
        if let Some(Value::Object(fields)) = usage {
            for (key, value) in fields {
                if !value.is_null() {
                    self.usage.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Last text block (trimmed) and last thinking block (line breaks collapsed).
    pub fn think_and_result(&self) -> (String, String) {
        let mut think = String::new();
        let mut result = String::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => result = text.trim().to_string(),
                ContentBlock::Thinking { thinking } => think = normalize_line_breaks(thinking),
                ContentBlock::Other => {}
            }
        }
        (think, result)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AnthropicState {
    pub detector: DegradationDetector,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicStrategy;

impl StreamStrategy for AnthropicStrategy {
    type Event = AnthropicEvent;
    type Aggregate = AnthropicMessage;
    type State = AnthropicState;

    fn create_state(&self) -> AnthropicState {
        AnthropicState::default()
    }

    async fn build_stream_session(
        &self,
        client: &ProviderClient,
        args: &ProviderArgs,
    ) -> Result<StreamSession<AnthropicEvent, AnthropicMessage>, RequestError> {
        let events = client.open_events(args).await?;

        let snapshot = Arc::new(Mutex::new(AnthropicMessage::default()));
        let sink = snapshot.clone();
        let decoded = events
            .filter(|item| {
                // Keep-alive frames carry no payload.
                let keep = !matches!(item, Ok(event) if event.data.trim().is_empty());
                async move { keep }
            })
            .filter_map(move |item| {
                let decoded = item.and_then(|event| decode(&event.data));
                let decoded = skip_malformed(PROVIDER, decoded);
                if let Some(Ok(event)) = &decoded {
                    sink.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .absorb(event);
                }
                async move { decoded }
            });

        let session = StreamSession::abortable(decoded, || {
            tracing::debug!(provider = PROVIDER, "stream closed");
            Ok(())
        })
        .with_finalize(move || Ok(snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()));
        Ok(session)
    }

    fn handle_item(
        &self,
        state: &mut AnthropicState,
        item: AnthropicEvent,
    ) -> Result<(), RequestError> {
        let AnthropicEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
            ..
        } = item
        else {
            return Ok(());
        };
        if !text.is_empty() && state.detector.feed(&text) {
            tracing::warn!(provider = PROVIDER, "degradation detected mid-stream");
            return Err(RequestError::Degraded);
        }
        Ok(())
    }

    fn finalize(
        &self,
        session: &mut StreamSession<AnthropicEvent, AnthropicMessage>,
        _state: AnthropicState,
    ) -> Result<StreamOutput, RequestError> {
        let finalize = session.take_finalize().ok_or_else(|| {
            RequestError::Contract("Anthropic stream session missing finalize".to_string())
        })?;
        let message = finalize()?;

        let (reasoning, result) = message.think_and_result();
        if DegradationDetector::has_output_degradation(&result) {
            tracing::warn!(provider = PROVIDER, "degradation detected in final output");
            return Err(RequestError::Degraded);
        }

        let usage = Value::Object(message.usage);
        Ok(StreamOutput {
            reasoning,
            result,
            input_tokens: usage_count(Some(&usage), "input_tokens"),
            output_tokens: usage_count(Some(&usage), "output_tokens"),
        })
    }
}
