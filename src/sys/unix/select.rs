use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::readiness::{Interest, Token};

/// `select(2)` fallback for platforms without epoll or kqueue. Capped at
/// `FD_SETSIZE` like every other select-based poller; the driver only ever
/// registers `max_clients + 1` fds, so this is not a practical limit for the
/// sizes this crate is built for.
#[derive(Debug)]
pub struct Selector {
    registered: parking_lot::Mutex<HashMap<RawFd, (Token, Interest)>>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            registered: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.registered.lock().insert(fd, (token, interests));
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.registered.lock().insert(fd, (token, interests));
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registered.lock().remove(&fd);
        Ok(())
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.inner.clear();

        let registered = self.registered.lock().clone();
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }
        let mut max_fd = -1;
        for (&fd, (_, interests)) in registered.iter() {
            if interests.is_readable() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interests.is_writable() {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            // Closed connections surface as zero-byte reads under select,
            // so errors are requested by also watching for readability
            // (spec §6, Poller backends).
            unsafe { libc::FD_SET(fd, &mut error_set) };
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map(|t| t as *mut _)
            .unwrap_or(std::ptr::null_mut());

        let n = loop {
            match syscall!(select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut error_set,
                tv_ptr,
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Ok(());
        }

        for (&fd, (token, _)) in registered.iter() {
            let mut ready = Interest::empty();
            if unsafe { libc::FD_ISSET(fd, &read_set) } {
                ready |= Interest::READ;
            }
            if unsafe { libc::FD_ISSET(fd, &write_set) } {
                ready |= Interest::WRITE;
            }
            if unsafe { libc::FD_ISSET(fd, &error_set) } {
                ready |= Interest::ERROR;
            }
            if !ready.is_empty() {
                events.inner.push((*token, ready));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Events {
    inner: Vec<(Token, Interest)>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, Interest)> + '_ {
        self.inner.iter().copied()
    }
}
