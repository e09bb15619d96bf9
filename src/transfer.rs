use std::sync::Arc;
use std::time::Instant;

use curl::easy::{Handler, WriteError};

use crate::completion::CompletionHandle;
use crate::request::Request;

/// Per-activation context bound to a transfer handle while it is registered
/// with the transfer library (spec §3, "Transfer Handle"). Created at
/// dispatch, consumed at completion.
pub struct TransferContext {
    pub request: Arc<Request>,
    pub completion: CompletionHandle,
    pub submit_time: Instant,
    pub dispatch_wall_time: Instant,
}

/// Implements the transfer library's write/header callback contract.
/// Reused across activations: `bind` resets every accumulator so a handle
/// coming back from the free-list never leaks a previous transfer's bytes.
pub struct TransferHandler {
    header_bytes: Vec<u8>,
    parsed_headers: Vec<(String, String)>,
    body: Vec<u8>,
    context: Option<TransferContext>,
    body_exceeded: bool,
}

impl TransferHandler {
    pub fn new() -> TransferHandler {
        TransferHandler {
            header_bytes: Vec::new(),
            parsed_headers: Vec::new(),
            body: Vec::new(),
            context: None,
            body_exceeded: false,
        }
    }

    pub fn bind(&mut self, context: TransferContext) {
        self.header_bytes.clear();
        self.parsed_headers.clear();
        self.body.clear();
        self.body_exceeded = false;
        self.context = Some(context);
    }

    pub fn take_context(&mut self) -> Option<TransferContext> {
        self.context.take()
    }

    pub fn context(&self) -> Option<&TransferContext> {
        self.context.as_ref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.parsed_headers
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    pub fn body_exceeded(&self) -> bool {
        self.body_exceeded
    }
}

impl Default for TransferHandler {
    fn default() -> Self {
        TransferHandler::new()
    }
}

impl Handler for TransferHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let request = match self.context.as_ref() {
            Some(ctx) => ctx.request.clone(),
            None => return Ok(data.len()),
        };

        if let Some(cb) = &request.streaming_callback {
            cb(data);
            return Ok(data.len());
        }

        if let Some(max) = request.max_body_length {
            if self.body.len() as u64 + data.len() as u64 > max {
                // A short write count aborts the transfer with a write
                // error, the documented way to cap response size (spec §6,
                // "max_body_length").
                self.body_exceeded = true;
                return Ok(0);
            }
        }

        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Some(cb) = self.context.as_ref().and_then(|c| c.request.header_callback.clone()) {
            cb(data);
        }

        self.header_bytes.extend_from_slice(data);
        let line = decode_latin1(data);
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return true;
        }

        // Each hop of a redirect chain sends its own `HTTP/...` status
        // line; the accumulator resets every time so only the final
        // response's headers survive (spec §9, "header reset semantics").
        if line.starts_with("HTTP/") {
            self.parsed_headers.clear();
            let reason = line
                .split_once(' ')
                .and_then(|(_, rest)| rest.split_once(' '))
                .map(|(_, reason)| reason)
                .unwrap_or("");
            self.parsed_headers
                .push(("X-Http-Reason".to_string(), reason.to_string()));
            return true;
        }

        if let Some((name, value)) = line.split_once(':') {
            self.parsed_headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }

        true
    }
}

/// Header lines are decoded as Latin-1 (spec §6, "Header parsing"): every
/// byte maps 1:1 onto its Unicode code point, so this never fails.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    fn context() -> TransferContext {
        TransferContext {
            request: Arc::new(Request::builder("http://example.com").build().unwrap()),
            completion: CompletionHandle::new(),
            submit_time: Instant::now(),
            dispatch_wall_time: Instant::now(),
        }
    }

    #[test]
    fn redirect_chain_keeps_only_final_headers() {
        let mut handler = TransferHandler::new();
        handler.bind(context());

        handler.header(b"HTTP/1.1 301 Moved Permanently\r\n");
        handler.header(b"Location: https://example.com/\r\n");
        handler.header(b"\r\n");
        handler.header(b"HTTP/1.1 200 OK\r\n");
        handler.header(b"Content-Type: text/plain\r\n");
        handler.header(b"\r\n");

        let headers = handler.headers();
        assert!(headers.iter().any(|(k, v)| k == "X-Http-Reason" && v == "OK"));
        assert!(!headers.iter().any(|(k, _)| k == "Location"));
        assert!(headers.iter().any(|(k, v)| k == "Content-Type" && v == "text/plain"));
    }

    #[test]
    fn body_beyond_max_length_aborts_write() {
        let mut handler = TransferHandler::new();
        let mut ctx = context();
        Arc::get_mut(&mut ctx.request).unwrap().max_body_length = Some(4);
        handler.bind(ctx);

        assert_eq!(handler.write(b"ab").unwrap(), 2);
        assert_eq!(handler.write(b"abc").unwrap(), 0);
        assert!(handler.body_exceeded());
    }
}
