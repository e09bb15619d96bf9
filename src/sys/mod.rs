//! OS-specific readiness poller and waker backends.
//!
//! `Selector` and `Waker` are re-exported under a single name per platform
//! family; the rest of the crate only ever names `crate::sys::Selector`,
//! never a backend directly (spec §6, "Poller backends": epoll / kqueue /
//! select are interchangeable behind one contract).

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{Events, Selector, Waker};
