use std::fmt;

/// Identifies a registration with the [`Poller`](crate::sys::Poller).
///
/// The driver uses the raw fd as the token's value, so lookups in the fd
/// handler table don't need a second indirection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<std::os::unix::io::RawFd> for Token {
    fn from(fd: std::os::unix::io::RawFd) -> Token {
        Token(fd as usize)
    }
}

bitflags::bitflags! {
    /// Interest to register for, or readiness reported back by the poller.
    ///
    /// `ERROR` is not something a caller asks for directly: [`register_fd`]
    /// always forces it on, matching the Python original's
    /// `events | self.ERROR` in `add_handler`.
    ///
    /// [`register_fd`]: crate::event_loop::EventLoop::register_fd
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const ERROR = 0b100;
    }
}

impl Interest {
    pub fn is_readable(self) -> bool {
        self.contains(Interest::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }
}
