use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::ClientError;
use crate::response::Response;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const FULFILLED: u8 = 2;
const CANCELLED: u8 = 3;

/// Outcome of a transfer, stashed in the handle once fulfilled (spec §3,
/// "Completion Handle").
#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    Error(ClientError),
}

struct Inner {
    status: AtomicU8,
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

/// One-shot future-like object handed to callers at submit time (spec §3).
/// States: pending -> running -> fulfilled, or pending/running -> cancelled.
/// `claim_running` and `fulfill` are the only mutators; both are safe to
/// call from any thread.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<Inner>,
}

impl CompletionHandle {
    pub fn new() -> CompletionHandle {
        CompletionHandle {
            inner: Arc::new(Inner {
                status: AtomicU8::new(PENDING),
                outcome: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Caller-side cancellation. No-op once the handle left PENDING/RUNNING.
    pub fn cancel(&self) -> bool {
        self.inner
            .status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                self.inner.status.compare_exchange(
                    RUNNING,
                    CANCELLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            })
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) == CANCELLED
    }

    /// Atomic `pending -> running` claim (spec §3). Returns `false` if the
    /// caller already cancelled; the driver must not construct a `Response`
    /// in that case.
    pub fn claim_running(&self) -> bool {
        self.inner
            .status
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `running -> fulfilled`, exactly once. Silently dropped if the handle
    /// was cancelled in the meantime (spec §4.2 step 4: "if already
    /// cancelled, drop silently").
    pub fn fulfill(&self, outcome: Outcome) {
        if self
            .inner
            .status
            .compare_exchange(RUNNING, FULFILLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *self.inner.outcome.lock() = Some(outcome);
        self.inner.ready.notify_all();
    }

    /// Blocks the calling thread until the handle reaches a terminal state,
    /// then returns the response or error. Returns `Err(ManagerStopped)` if
    /// cancelled before fulfilment and nothing else claimed it.
    pub fn wait(&self) -> Result<Response, ClientError> {
        let mut guard = self.inner.outcome.lock();
        loop {
            if let Some(outcome) = guard.take() {
                return match outcome {
                    Outcome::Response(r) => Ok(r),
                    Outcome::Error(e) => Err(e),
                };
            }
            if self.inner.status.load(Ordering::Acquire) == CANCELLED {
                return Err(ClientError::ManagerStopped);
            }
            self.inner.ready.wait(&mut guard);
        }
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        CompletionHandle::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::TimingInfo;
    use crate::request::Request;
    use std::sync::Arc as StdArc;
    use std::time::Instant;

    fn dummy_response() -> Response {
        Response {
            request: StdArc::new(Request::builder("http://example.com").build().unwrap()),
            code: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
            body: Some(Vec::new()),
            effective_url: "http://example.com".to_string(),
            error: None,
            request_time: Default::default(),
            start_time: Instant::now(),
            time_info: TimingInfo::default(),
            primary_ip: None,
            speed_download: 0.0,
            speed_upload: 0.0,
        }
    }

    #[test]
    fn claim_then_fulfill_is_observed_by_wait() {
        let handle = CompletionHandle::new();
        assert!(handle.claim_running());
        handle.fulfill(Outcome::Response(dummy_response()));
        let response = handle.wait().unwrap();
        assert_eq!(response.code, 200);
    }

    #[test]
    fn cancel_before_claim_prevents_running() {
        let handle = CompletionHandle::new();
        assert!(handle.cancel());
        assert!(!handle.claim_running());
    }

    #[test]
    fn fulfill_after_cancel_is_dropped_silently() {
        let handle = CompletionHandle::new();
        assert!(handle.claim_running());
        assert!(handle.cancel());
        handle.fulfill(Outcome::Response(dummy_response()));
        assert_eq!(handle.wait().unwrap_err().to_string(), ClientError::ManagerStopped.to_string());
    }

    #[test]
    fn fulfill_is_exactly_once() {
        let handle = CompletionHandle::new();
        assert!(handle.claim_running());
        handle.fulfill(Outcome::Response(dummy_response()));
        handle.fulfill(Outcome::Error(ClientError::ManagerStopped));
        let response = handle.wait().unwrap();
        assert_eq!(response.code, 200);
    }
}
