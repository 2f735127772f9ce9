//! Explicitly constructed pool of provider HTTP clients.
//!
//! Clients are cached per (endpoint, credential, format, timeout, headers).
//! Each one carries the transport timeouts: the read timeout is what unblocks
//! a stream pull that the consumer's boundary checks cannot reach.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};

use crate::args::ProviderArgs;
use crate::error::RequestError;
use crate::model::ApiFormat;

/// Placeholder credential for endpoints that take no key (local servers).
pub const NO_KEY_REQUIRED: &str = "no_key_required";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_ERROR_BODY_BYTES: usize = 2 * 1024 * 1024; // 2MB

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GOOGLE_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
const GOOGLE_DEFAULT_VERSION: &str = "v1beta";

pub type SseStream = BoxStream<'static, Result<Event, RequestError>>;

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Canonical base URL for `format`.
pub fn normalize_api_url(url: &str, format: ApiFormat) -> String {
    let url = url.trim().trim_end_matches('/');
    match format {
        ApiFormat::OpenAi | ApiFormat::Sakura => url
            .strip_suffix("/chat/completions")
            .unwrap_or(url)
            .trim_end_matches('/')
            .to_string(),
        ApiFormat::Google | ApiFormat::Anthropic => url.to_string(),
    }
}

/// Split a trailing `/v1beta` or `/v1` off a Google base URL.
pub fn parse_google_api_url(url: &str) -> (String, Option<String>) {
    let url = url.trim().trim_end_matches('/');
    for version in ["v1beta", "v1"] {
        if let Some(base) = url.strip_suffix(&format!("/{version}")) {
            return (base.to_string(), Some(version.to_string()));
        }
    }
    (url.to_string(), None)
}

// ---------------------------------------------------------------------------
// ProviderClient
// ---------------------------------------------------------------------------

/// Ready-to-use transport for one endpoint + credential.
pub struct ProviderClient {
    http: Client,
    format: ApiFormat,
    base_url: String,
    api_version: Option<String>,
    api_key: String,
    headers: BTreeMap<String, String>,
}

impl ProviderClient {
    pub fn format(&self) -> ApiFormat {
        self.format
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Streaming endpoint for `model`.
    pub fn endpoint(&self, model: &str) -> String {
        match self.format {
            ApiFormat::OpenAi | ApiFormat::Sakura => {
                let base = non_empty_or(&self.base_url, OPENAI_DEFAULT_BASE);
                format!("{base}/chat/completions")
            }
            ApiFormat::Anthropic => {
                let base = non_empty_or(&self.base_url, ANTHROPIC_DEFAULT_BASE);
                format!("{base}/v1/messages")
            }
            ApiFormat::Google => {
                let base = non_empty_or(&self.base_url, GOOGLE_DEFAULT_BASE);
                let version = self.api_version.as_deref().unwrap_or(GOOGLE_DEFAULT_VERSION);
                format!("{base}/{version}/models/{model}:streamGenerateContent?alt=sse")
            }
        }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        match self.format {
            ApiFormat::OpenAi | ApiFormat::Sakura => {
                vec![("authorization", format!("Bearer {}", self.api_key))]
            }
            ApiFormat::Anthropic => vec![
                ("x-api-key", self.api_key.clone()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            ApiFormat::Google => vec![("x-goog-api-key", self.api_key.clone())],
        }
    }

    fn header_map(&self, args: &ProviderArgs) -> Result<HeaderMap, RequestError> {
        let mut map = HeaderMap::new();
        let auth = self
            .auth_headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value));
        // Later entries win: auth, then client-level, then per-request headers.
        let entries = auth
            .chain(self.headers.clone())
            .chain(args.headers.clone());
        for (name, value) in entries {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RequestError::Config(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| RequestError::Config(format!("invalid value for header {name}: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// POST `args.body` and return the response as a stream of SSE events.
    pub async fn open_events(&self, args: &ProviderArgs) -> Result<SseStream, RequestError> {
        let provider = self.format.as_str();
        let url = self.endpoint(&args.model);
        tracing::debug!(provider, model = %args.model, "opening stream");

        let response = self
            .http
            .post(&url)
            .headers(self.header_map(args)?)
            .json(&args.body)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RequestError::RateLimited {
                provider: provider.to_string(),
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RequestError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let body = read_error_body(response, provider).await;
            let text = String::from_utf8_lossy(&body);
            return Err(RequestError::Upstream {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let events = response.bytes_stream().eventsource().map(|item| {
            item.map_err(|e| match e {
                EventStreamError::Transport(e) => RequestError::Request(e),
                other => RequestError::Stream(other.to_string()),
            })
        });
        Ok(events.boxed())
    }
}

/// Read at most `MAX_ERROR_BODY_BYTES` of an error response, then stop.
async fn read_error_body(response: reqwest::Response, provider: &str) -> Vec<u8> {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                let room = MAX_ERROR_BODY_BYTES - body.len();
                body.extend_from_slice(&bytes[..bytes.len().min(room)]);
                if body.len() >= MAX_ERROR_BODY_BYTES {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(provider, error = %e, "failed to read error body");
                break;
            }
        }
    }
    body
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

// ---------------------------------------------------------------------------
// ClientPool
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    url: String,
    key: String,
    format: ApiFormat,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

pub struct ClientPool {
    proxy: Option<String>,
    default_headers: BTreeMap<String, String>,
    key_index: AtomicUsize,
    clients: Mutex<HashMap<ClientKey, Arc<ProviderClient>>>,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ClientPool {
    pub fn new(proxy: Option<String>) -> Self {
        let default_headers = BTreeMap::from([(
            "User-Agent".to_string(),
            format!("lingo/{}", env!("CARGO_PKG_VERSION")),
        )]);
        Self {
            proxy,
            default_headers,
            key_index: AtomicUsize::new(0),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_headers(&self) -> &BTreeMap<String, String> {
        &self.default_headers
    }

    /// Next credential in round-robin order.
    pub fn next_key(&self, keys: &[String]) -> String {
        match keys {
            [] => NO_KEY_REQUIRED.to_string(),
            [only] => only.clone(),
            _ => {
                let i = self.key_index.fetch_add(1, Ordering::Relaxed);
                keys[i % keys.len()].clone()
            }
        }
    }

    /// Drop every cached client and rewind key rotation to the first key.
    pub fn reset(&self) {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.key_index.store(0, Ordering::Relaxed);
        tracing::debug!("client pool reset");
    }

    /// Cached client for the given endpoint. `extra_headers` must already be
    /// sorted by name so equal header sets share one client.
    pub fn get_client(
        &self,
        url: &str,
        key: &str,
        format: ApiFormat,
        timeout: Duration,
        extra_headers: &[(String, String)],
    ) -> Result<Arc<ProviderClient>, RequestError> {
        let cache_key = ClientKey {
            url: url.to_string(),
            key: key.to_string(),
            format,
            timeout,
            headers: extra_headers.to_vec(),
        };

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&cache_key) {
            return Ok(client.clone());
        }

        let client = Arc::new(self.build_client(&cache_key)?);
        clients.insert(cache_key, client.clone());
        Ok(client)
    }

    fn build_client(&self, key: &ClientKey) -> Result<ProviderClient, RequestError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(key.timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let normalized = normalize_api_url(&key.url, key.format);
        let (base_url, api_version) = match key.format {
            ApiFormat::Google => parse_google_api_url(&normalized),
            _ => (normalized, None),
        };

        Ok(ProviderClient {
            http: builder.build()?,
            format: key.format,
            base_url,
            api_version,
            api_key: key.key.clone(),
            headers: key.headers.iter().cloned().collect(),
        })
    }
}
