//! A concurrent HTTP client engine: a fixed pool of worker threads, each
//! driving its own readiness-based event loop that multiplexes many
//! in-flight HTTP/HTTPS transfers over libcurl's multi interface.
//!
//! Callers submit a [`Request`] to a [`Manager`] and get back a
//! [`CompletionHandle`]; workers pick requests off a bounded shared queue,
//! issue them concurrently on non-blocking sockets, and fulfil the handle
//! with a [`Response`] or a [`ClientError`].
//!
//! ```no_run
//! use curlmux::{Manager, ManagerConfig, Request};
//!
//! let manager = Manager::new(ManagerConfig::default());
//! manager.start().unwrap();
//!
//! let request = Request::builder("https://example.com").build().unwrap();
//! let response = manager.submit(request).wait().unwrap();
//! println!("{}", response.code);
//!
//! manager.stop(std::time::Duration::from_secs(5));
//! ```
//!
//! # Features
//!
//! `log` (default): routes the default exception hook and worker lifecycle
//! messages through the `log` crate's macros. Disable it to take over
//! logging entirely via a custom [`ExceptionHook`].

#![warn(rust_2018_idioms)]

#[macro_use]
mod macros;

mod completion;
mod driver;
mod error;
mod event_loop;
mod lifecycle;
mod manager;
mod periodic;
mod poller;
mod queue;
mod readiness;
mod request;
mod response;
mod sys;
mod timer;
mod transfer;

pub use completion::{CompletionHandle, Outcome};
pub use error::{ClientError, ExceptionHook, LoggingExceptionHook};
pub use event_loop::EventLoop;
pub use lifecycle::{Lifecycle, State};
pub use manager::{Manager, ManagerConfig};
pub use periodic::PeriodicCallback;
pub use queue::{Queue, QueuedItem};
pub use readiness::Interest;
pub use request::{AuthMode, Method, Request, RequestBuilder, ResolveOverride};
pub use response::{Response, TimingInfo};
pub use timer::CancelToken;
