pub mod anthropic;
pub mod client_pool;
pub mod google;
pub mod openai;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One normalized chat message, as handed over by the translation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Decode one SSE `data:` payload into a provider event type.
pub(crate) fn decode_event<T: DeserializeOwned>(provider: &str, data: &str) -> Result<T, RequestError> {
    serde_json::from_str(data)
        .map_err(|e| RequestError::SchemaParse(format!("{provider} stream event: {e}")))
}

/// Drop a frame that failed to decode. Anything else passes through.
///
/// Providers occasionally interleave comments or truncated payloads; one bad
/// frame must not cost the whole response.
pub(crate) fn skip_malformed<T>(
    provider: &str,
    decoded: Result<T, RequestError>,
) -> Option<Result<T, RequestError>> {
    match decoded {
        Err(RequestError::SchemaParse(reason)) => {
            tracing::debug!(provider, %reason, "skipping unparseable stream event");
            None
        }
        other => Some(other),
    }
}
