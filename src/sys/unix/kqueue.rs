use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::readiness::{Interest, Token};

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $data:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as _,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as _,
        }
    };
}

#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.apply(fd, token, interests, libc::EV_ADD)
    }

    /// kqueue has no in-place "modify": the driver's fd-bridging policy
    /// already unregisters before re-registering on every event anyway
    /// (spec §4.2), so `reregister` here just re-applies both filters.
    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.apply(fd, token, interests, libc::EV_ADD)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE, 0usize),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0usize),
        ];
        // Ignore ENOENT: the filter may not have been registered.
        unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as Count,
                changes.as_mut_ptr(),
                0,
                ptr::null(),
            );
        }
        Ok(())
    }

    fn apply(&self, fd: RawFd, token: Token, interests: Interest, base_flags: i16) -> io::Result<()> {
        let read_flags = if interests.is_readable() {
            base_flags
        } else {
            libc::EV_DELETE
        };
        let write_flags = if interests.is_writable() {
            base_flags
        } else {
            libc::EV_DELETE
        };
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, read_flags, token.0),
            kevent!(fd, libc::EVFILT_WRITE, write_flags, token.0),
        ];
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            0,
            ptr::null(),
        ))
        .map(drop)
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(ptr::null());

        events.inner.clear();
        let cap = events.inner.capacity();
        let n = loop {
            match syscall!(kevent(
                self.kq,
                ptr::null(),
                0,
                events.inner.as_mut_ptr(),
                cap as Count,
                ts_ptr,
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::kevent>,
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
            if e.flags & libc::EV_ERROR != 0 {
                ready |= Interest::ERROR;
            }
            match e.filter as i16 {
                libc::EVFILT_READ => ready |= Interest::READ,
                libc::EVFILT_WRITE => {
                    // A write-side EOF (e.g. the peer reset the connection)
                    // is reported here, not as EVFILT_READ. Normalize it to
                    // ERROR so callers see one consistent signal across
                    // epoll/kqueue/select (spec §6, "Poller backends").
                    if e.flags & libc::EV_EOF != 0 {
                        ready |= Interest::ERROR;
                    } else {
                        ready |= Interest::WRITE;
                    }
                }
                _ => {}
            }
            (Token(e.udata as usize), ready)
        })
    }
}
