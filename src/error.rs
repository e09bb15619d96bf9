use std::fmt;

/// Every fallible operation in this crate returns `Result<T, ClientError>`.
///
/// Variants are the tagged, disjoint error kinds from spec §7. They're kept
/// flat rather than nested under a handful of umbrella variants because
/// callers match on them directly (e.g. to distinguish `QueueFull` from a
/// `TransportError` for retry logic).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("submission queue is full")]
    QueueFull,

    #[error("manager is not started")]
    ManagerNotStarted,

    #[error("manager is stopped")]
    ManagerStopped,

    #[error("failed to materialize request options: {0}")]
    SetupError(#[source] curl::Error),

    #[error("transport error (curl code {errno}): {message}")]
    TransportError { errno: i32, message: String },

    #[error("http status error: {code} {reason}")]
    HttpStatusError {
        code: u32,
        reason: String,
        response: Box<crate::response::Response>,
    },

    #[error("unsupported option: {0}")]
    UnsupportedOption(&'static str),

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("body invalid for method {method}: {reason}")]
    InvalidBodyForMethod { method: String, reason: &'static str },

    #[error("event loop used from a different process than created it")]
    CrossProcessUse,

    #[error("operation not valid in current lifecycle state: {0}")]
    LifecycleWrongState(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Synthesized HTTP status code for transport-level failures (spec §6,
    /// Response: "error of HTTP-status kind" / §7 `transport-error`).
    pub fn synthetic_code(&self) -> u32 {
        match self {
            ClientError::TransportError { .. } => 599,
            ClientError::HttpStatusError { code, .. } => *code,
            _ => 0,
        }
    }
}

/// A hook for routing exceptions raised inside event loop callbacks, timers,
/// and fd handlers (spec §4.1 "pluggable exception hook", §7 propagation
/// policy). The default hook just logs.
pub trait ExceptionHook: Send + Sync {
    fn handle(&self, context: &str, error: &dyn std::error::Error);
}

#[derive(Debug, Default)]
pub struct LoggingExceptionHook;

impl ExceptionHook for LoggingExceptionHook {
    fn handle(&self, context: &str, error: &dyn std::error::Error) {
        log::error!("exception in {context}: {error}");
    }
}

impl fmt::Debug for dyn ExceptionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn ExceptionHook")
    }
}
