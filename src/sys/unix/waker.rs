use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Self-pipe used to interrupt a blocked `poll`/`select`/`epoll_wait` from
/// another thread. One byte in means "wake up"; any number of writes before
/// the reader drains collapse into a single observed wake, since the reader
/// empties the whole buffer on read (spec §4.1, "Wake semantics").
#[derive(Debug)]
pub struct Waker {
    reader: File,
    writer: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        let [reader, writer] = fds;
        Ok(Waker {
            reader: unsafe { File::from_raw_fd(reader) },
            writer: unsafe { File::from_raw_fd(writer) },
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Pipe buffer is full; the reader hasn't drained a previous
                // wake yet, which already guarantees a future wake-up.
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(e) => Err(e),
        }
    }

    /// Drain every pending byte. Idempotent: calling this with nothing
    /// pending is a harmless `WouldBlock`.
    pub fn drain(&self) {
        let mut buf = [0u8; 4096];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}
