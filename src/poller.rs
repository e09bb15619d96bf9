use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::readiness::{Interest, Token};
use crate::sys;

/// OS-abstracted fd readiness poller (component B). Thin wrapper over
/// whichever backend `sys::Selector` resolves to on this platform.
#[derive(Debug)]
pub struct Poller {
    selector: sys::Selector,
}

pub use sys::Events;

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.register(fd, token, interests)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.reregister(fd, token, interests)
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }

    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.selector.select(events, timeout)
    }
}
