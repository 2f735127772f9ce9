use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide accounting of requests currently on the wire.
///
/// The scheduler owns the implementation; the requester only pairs every
/// increment with exactly one decrement.
pub trait RequestTracker: Send + Sync {
    fn inc_request_in_flight(&self);
    fn dec_request_in_flight(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    Idle,
    Testing,
    Translating,
    Stopping,
}

/// Run state and in-flight counter shared by every requester of a process.
#[derive(Debug, Default)]
pub struct Engine {
    status: Mutex<EngineStatus>,
    in_flight: AtomicUsize,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Atomically move from IDLE to `status`. Returns false if the engine was busy.
    pub fn try_occupy(&self, status: EngineStatus) -> bool {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != EngineStatus::Idle {
            return false;
        }
        *guard = status;
        true
    }

    pub fn request_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl RequestTracker for Engine {
    fn inc_request_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_request_in_flight(&self) {
        // Saturating: a stray decrement must not wrap the counter.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
