//! Stream plumbing shared by every provider: the cancellation/deadline token,
//! the scoped session over one open provider stream, the consumer that drives
//! a session to completion, and the strategy trait providers implement.
//!
//! Cancellation and deadline are best-effort and boundary-checked: they are
//! observed before each pull, never while a pull is pending. Preemption inside
//! a pending read is the transport's job (the client pool configures a read
//! timeout), or any holder of the session's [`SessionCloser`] can abort the
//! transport from outside.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::args::ProviderArgs;
use crate::dispatch::client_pool::ProviderClient;
use crate::error::RequestError;

pub type StopChecker = Arc<dyn Fn() -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// StreamControl
// ---------------------------------------------------------------------------

/// Immutable stop/deadline token handed to every stream consumption.
#[derive(Clone, Default)]
pub struct StreamControl {
    stop_checker: Option<StopChecker>,
    deadline: Option<Instant>,
}

impl StreamControl {
    pub fn new(stop_checker: Option<StopChecker>, deadline: Option<Instant>) -> Self {
        Self {
            stop_checker,
            deadline,
        }
    }

    /// Poll a tokio-util token instead of a custom predicate.
    pub fn from_token(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self::new(Some(Arc::new(move || token.is_cancelled())), deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_checker.as_ref().is_some_and(|check| check())
    }

    pub fn is_deadline_reached(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamControl")
            .field("stop_checker", &self.stop_checker.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionCloser
// ---------------------------------------------------------------------------

type CloseFn = Box<dyn FnOnce() -> Result<(), RequestError> + Send>;

/// Idempotent, thread-safe close handle for one transport resource.
///
/// The closed flag flips before the hook runs, so a second call (racing, or
/// re-entrant from inside the hook) returns immediately. Hook failures are
/// logged and swallowed: cleanup must never mask the primary error.
#[derive(Clone)]
pub struct SessionCloser {
    inner: Arc<CloserInner>,
}

struct CloserInner {
    closed: AtomicBool,
    hook: Mutex<Option<CloseFn>>,
}

impl SessionCloser {
    pub fn new<F>(hook: F) -> Self
    where
        F: FnOnce() -> Result<(), RequestError> + Send + 'static,
    {
        Self {
            inner: Arc::new(CloserInner {
                closed: AtomicBool::new(false),
                hook: Mutex::new(Some(Box::new(hook))),
            }),
        }
    }

    pub fn noop() -> Self {
        Self::new(|| Ok(()))
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Take the hook and release the lock before running it.
        let hook = self
            .inner
            .hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook
            && let Err(e) = hook()
        {
            tracing::debug!("stream close failed (ignored): {e}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SessionCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCloser")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StreamSession
// ---------------------------------------------------------------------------

pub type Finalizer<A> = Box<dyn FnOnce() -> Result<A, RequestError> + Send>;

/// Scoped handle over one in-flight provider stream.
///
/// Owns the event stream, the close handle, and (for providers that assemble
/// a final message of their own) a finalize callable. Dropping the session
/// closes it.
pub struct StreamSession<E, A> {
    events: BoxStream<'static, Result<E, RequestError>>,
    closer: SessionCloser,
    finalize: Option<Finalizer<A>>,
}

impl<E, A> StreamSession<E, A> {
    pub fn new<S>(events: S, closer: SessionCloser) -> Self
    where
        S: Stream<Item = Result<E, RequestError>> + Send + 'static,
    {
        Self {
            events: events.boxed(),
            closer,
            finalize: None,
        }
    }

    /// Wrap a stream so that closing the session also aborts the transport,
    /// waking a pull that is pending on it. `on_close` runs after the abort.
    pub fn abortable<S, F>(events: S, on_close: F) -> Self
    where
        S: Stream<Item = Result<E, RequestError>> + Send + 'static,
        F: FnOnce() -> Result<(), RequestError> + Send + 'static,
    {
        let (events, handle) = futures_util::stream::abortable(events);
        let closer = SessionCloser::new(move || {
            handle.abort();
            on_close()
        });
        Self::new(events, closer)
    }

    pub fn with_finalize<F>(mut self, finalize: F) -> Self
    where
        F: FnOnce() -> Result<A, RequestError> + Send + 'static,
    {
        self.finalize = Some(Box::new(finalize));
        self
    }

    pub fn closer(&self) -> SessionCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn has_finalize(&self) -> bool {
        self.finalize.is_some()
    }

    /// Take the provider finalize callable. Can only succeed once.
    pub fn take_finalize(&mut self) -> Option<Finalizer<A>> {
        self.finalize.take()
    }

    async fn next_event(&mut self) -> Option<Result<E, RequestError>> {
        self.events.next().await
    }
}

impl<E, A> Drop for StreamSession<E, A> {
    fn drop(&mut self) {
        self.closer.close();
    }
}

// ---------------------------------------------------------------------------
// StreamConsumer
// ---------------------------------------------------------------------------

pub struct StreamConsumer;

impl StreamConsumer {
    /// Pull `session` to exhaustion, invoking `on_item` per event.
    ///
    /// Before each pull: stop requested → [`RequestError::Cancelled`]; deadline
    /// passed → [`RequestError::HardTimeout`]. Errors from the transport or
    /// from `on_item` propagate unchanged. The session is closed exactly once
    /// on every exit path.
    pub async fn consume<E, A, F>(
        session: &mut StreamSession<E, A>,
        control: &StreamControl,
        mut on_item: F,
    ) -> Result<(), RequestError>
    where
        F: FnMut(E) -> Result<(), RequestError>,
    {
        let outcome = Self::drive(session, control, &mut on_item).await;
        session.close();
        outcome
    }

    async fn drive<E, A, F>(
        session: &mut StreamSession<E, A>,
        control: &StreamControl,
        on_item: &mut F,
    ) -> Result<(), RequestError>
    where
        F: FnMut(E) -> Result<(), RequestError>,
    {
        loop {
            if control.is_stop_requested() {
                return Err(RequestError::Cancelled);
            }
            if control.is_deadline_reached() {
                return Err(RequestError::HardTimeout);
            }
            match session.next_event().await {
                None => return Ok(()),
                Some(item) => on_item(item?)?,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StreamStrategy
// ---------------------------------------------------------------------------

/// Normalized outcome of one provider stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutput {
    pub reasoning: String,
    pub result: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Provider-specific adapter over the common streaming contract.
///
/// Lifecycle per call: `create_state` → `build_stream_session` → `handle_item`
/// for every event → `finalize`.
pub trait StreamStrategy: Send + Sync {
    /// Protocol-native event, decoded once at the transport boundary.
    type Event: Send + 'static;
    /// Provider-assembled final message, when the provider has one.
    type Aggregate: Send + 'static;
    type State: Send;

    fn create_state(&self) -> Self::State;

    fn build_stream_session(
        &self,
        client: &ProviderClient,
        args: &ProviderArgs,
    ) -> impl Future<Output = Result<StreamSession<Self::Event, Self::Aggregate>, RequestError>> + Send;

    fn handle_item(&self, state: &mut Self::State, item: Self::Event)
    -> Result<(), RequestError>;

    fn finalize(
        &self,
        session: &mut StreamSession<Self::Event, Self::Aggregate>,
        state: Self::State,
    ) -> Result<StreamOutput, RequestError>;
}

/// Collapse runs of line breaks into one, after trimming.
pub fn normalize_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_newline = false;
    for c in text.trim().chars() {
        if c == '\n' {
            if !prev_newline {
                out.push(c);
            }
            prev_newline = true;
        } else {
            out.push(c);
            prev_newline = false;
        }
    }
    out
}

/// Coerce a provider usage counter to an integer. Anything non-numeric is 0.
pub fn usage_count(usage: Option<&serde_json::Value>, field: &str) -> u64 {
    let Some(value) = usage.and_then(|u| u.get(field)) else {
        return 0;
    };
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_breaks_collapse() {
        assert_eq!(normalize_line_breaks("  A\n\n\nB\n "), "A\nB");
        assert_eq!(normalize_line_breaks(""), "");
    }

    #[test]
    fn usage_count_defaults_to_zero() {
        let usage = json!({"a": 3, "b": "x", "c": {"n": 1}, "d": "7", "e": -2});
        assert_eq!(usage_count(Some(&usage), "a"), 3);
        assert_eq!(usage_count(Some(&usage), "b"), 0);
        assert_eq!(usage_count(Some(&usage), "c"), 0);
        assert_eq!(usage_count(Some(&usage), "d"), 7);
        assert_eq!(usage_count(Some(&usage), "e"), 0);
        assert_eq!(usage_count(Some(&usage), "missing"), 0);
        assert_eq!(usage_count(None, "a"), 0);
        assert_eq!(usage_count(Some(&json!("not an object")), "a"), 0);
    }

    #[test]
    fn control_without_checker_never_stops() {
        let control = StreamControl::default();
        assert!(!control.is_stop_requested());
        assert!(!control.is_deadline_reached());
    }

    #[test]
    fn control_from_token_follows_token() {
        let token = CancellationToken::new();
        let control = StreamControl::from_token(token.clone(), None);
        assert!(!control.is_stop_requested());
        token.cancel();
        assert!(control.is_stop_requested());
    }

    #[test]
    fn closer_runs_hook_once() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let closer = SessionCloser::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        closer.close();
        closer.clone().close();
        assert!(closer.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
