use thiserror::Error;

/// Coarse classification callers branch on when deciding retry/backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-requested stop. Never counted as a translation failure.
    Cancelled,
    /// Request-level deadline passed at a stream boundary.
    Timeout,
    /// Repetitive, low-information model output.
    Degraded,
    /// Anything else coming out of the transport or the provider.
    Generic,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("stop requested")]
    Cancelled,

    #[error("deadline exceeded")]
    HardTimeout,

    #[error("degradation detected")]
    Degraded,

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// A strategy was driven in a way its contract forbids (e.g. finalize
    /// without a provider aggregate). Not retryable.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("config error: {0}")]
    Config(String),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::HardTimeout => ErrorKind::Timeout,
            Self::Degraded => ErrorKind::Degraded,
            _ => ErrorKind::Generic,
        }
    }

    /// Extract provider name from structured error variants.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Returns true for failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HardTimeout | Self::Degraded => true,
            Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => {
                // status: None = ambiguous (mid-stream error event) → not retryable
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) | Self::Stream(_) => true,
            _ => false,
        }
    }

    /// Sanitized message for UI/log surfaces. Does not leak URLs or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled => "request cancelled".to_string(),
            Self::HardTimeout => "request timed out".to_string(),
            Self::Degraded => "model output degraded into repetition".to_string(),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, message } => {
                format!("authentication failed for {provider}: {message}")
            }
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Stream(_) => "provider stream interrupted".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Contract(msg) => format!("internal error: {msg}"),
            Self::Config(msg) => format!("config error: {msg}"),
        }
    }
}
