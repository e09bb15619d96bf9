use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::request::Request;

/// Per-stage timing breakdown, read off the easy handle's `*_time` info
/// fields plus the queue wait this crate tracks itself (spec §6, Response:
/// "time_info").
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingInfo {
    pub queue: Duration,
    pub namelookup: Duration,
    pub connect: Duration,
    pub appconnect: Duration,
    pub pretransfer: Duration,
    pub starttransfer: Duration,
    pub total: Duration,
    pub redirect: Duration,
}

/// Result of a completed transfer, successful or not (spec §6, "Response").
/// A transport or HTTP-status failure still produces a `Response` with
/// `error` set; `rethrow` is how callers opt back into `Result`-style
/// propagation.
#[derive(Debug, Clone)]
pub struct Response {
    pub request: Arc<Request>,
    pub code: u32,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub effective_url: String,
    pub error: Option<Arc<ClientError>>,
    pub request_time: Duration,
    pub start_time: Instant,
    pub time_info: TimingInfo,
    pub primary_ip: Option<String>,
    pub speed_download: f64,
    pub speed_upload: f64,
}

impl Response {
    /// Returns the header's value, first match, case-insensitively (HTTP
    /// header names are case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Turns a failed response back into an `Err`, the way `tornado`'s
    /// `HTTPResponse.rethrow` does (spec §6, "Response.rethrow").
    pub fn rethrow(&self) -> Result<(), ClientError> {
        match &self.error {
            Some(err) => Err(clone_error(err)),
            None => Ok(()),
        }
    }
}

/// `ClientError` doesn't derive `Clone` (it wraps `curl::Error` and a boxed
/// response), so a rethrown error is reconstructed into an equivalent,
/// self-contained variant instead of cloning the original.
fn clone_error(err: &Arc<ClientError>) -> ClientError {
    match err.as_ref() {
        ClientError::QueueFull => ClientError::QueueFull,
        ClientError::ManagerNotStarted => ClientError::ManagerNotStarted,
        ClientError::ManagerStopped => ClientError::ManagerStopped,
        ClientError::TransportError { errno, message } => ClientError::TransportError {
            errno: *errno,
            message: message.clone(),
        },
        ClientError::HttpStatusError {
            code,
            reason,
            response,
        } => ClientError::HttpStatusError {
            code: *code,
            reason: reason.clone(),
            response: response.clone(),
        },
        ClientError::UnsupportedOption(opt) => ClientError::UnsupportedOption(opt),
        ClientError::InvalidMethod(m) => ClientError::InvalidMethod(m.clone()),
        ClientError::InvalidBodyForMethod { method, reason } => {
            ClientError::InvalidBodyForMethod {
                method: method.clone(),
                reason,
            }
        }
        ClientError::CrossProcessUse => ClientError::CrossProcessUse,
        ClientError::LifecycleWrongState(s) => ClientError::LifecycleWrongState(s),
        ClientError::SetupError(_) | ClientError::Io(_) => {
            ClientError::TransportError {
                errno: -1,
                message: err.to_string(),
            }
        }
    }
}
