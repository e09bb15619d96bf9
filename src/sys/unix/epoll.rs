use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::readiness::{Interest, Token};

#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { epfd })
    }

    /// Level-triggered by construction: no `EPOLLET`. A handler that doesn't
    /// drain a readable fd will simply see it reported again on the next
    /// iteration, matching the Python original's `select.epoll()` default.
    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event)).map(drop)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event)).map(drop)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Linux < 2.6.9 requires a non-null event pointer even though it's
        // ignored for EPOLL_CTL_DEL.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event)).map(drop)
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        events.inner.clear();
        let cap = events.inner.capacity();
        let n = loop {
            match syscall!(epoll_wait(
                self.epfd,
                events.inner.as_mut_ptr(),
                cap as i32,
                timeout_ms,
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        // SAFETY: `epoll_wait` just initialized the first `n` slots.
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;
    if interests.is_readable() {
        kind |= libc::EPOLLIN;
    }
    if interests.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    if interests.is_error() {
        kind |= libc::EPOLLERR | libc::EPOLLHUP;
    }
    kind as u32
}

#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, Interest)> + '_ {
        self.inner.iter().map(|e| {
            let mut ready = Interest::empty();
            let bits = e.events as i32;
            if bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
                ready |= Interest::READ;
            }
            if bits & libc::EPOLLOUT != 0 {
                ready |= Interest::WRITE;
            }
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                ready |= Interest::ERROR;
            }
            (Token(e.u64 as usize), ready)
        })
    }
}
