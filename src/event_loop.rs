use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{ClientError, ExceptionHook, LoggingExceptionHook};
use crate::lifecycle::{Lifecycle, State};
use crate::poller::{Events, Poller};
use crate::readiness::{Interest, Token};
use crate::sys::Waker;
use crate::timer::{CancelToken, TimerHeap};

/// Upper bound on `poll`'s timeout when the timer heap is empty (spec §4.1
/// main step 6).
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3600);

type FdHandler = Arc<dyn Fn(Interest) -> io::Result<()> + Send + Sync>;

struct HandlerEntry {
    handler: FdHandler,
    interests: Interest,
}

/// Thread-safe, single-threaded-cooperative scheduler hosting fd
/// readiness, timers, and a cross-thread callback queue (component D,
/// spec §4.1). Exactly one thread runs `run`'s main step at a time.
pub struct EventLoop {
    poller: Poller,
    waker: Waker,
    timers: TimerHeap,
    callbacks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    handlers: Mutex<HashMap<RawFd, HandlerEntry>>,
    lifecycle: Lifecycle,
    exception_hook: Arc<dyn ExceptionHook>,
    pid: u32,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_exception_hook(Arc::new(LoggingExceptionHook))
    }

    pub fn with_exception_hook(exception_hook: Arc<dyn ExceptionHook>) -> io::Result<EventLoop> {
        Ok(EventLoop {
            poller: Poller::new()?,
            waker: Waker::new()?,
            timers: TimerHeap::new(),
            callbacks: Mutex::new(VecDeque::new()),
            handlers: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
            exception_hook,
            pid: std::process::id(),
        })
    }

    pub fn state(&self) -> State {
        self.lifecycle.current()
    }

    fn require_started(&self) -> Result<(), ClientError> {
        if self.lifecycle.is(State::Started) {
            Ok(())
        } else {
            Err(ClientError::LifecycleWrongState("event loop is not STARTED"))
        }
    }

    /// Appends `f` to the callback deque and wakes the loop. Fails if the
    /// loop isn't STARTED.
    pub fn submit_callback<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.require_started()?;
        self.callbacks.lock().push_back(Box::new(f));
        self.waker.wake()?;
        Ok(())
    }

    pub fn schedule_at<F>(&self, deadline: Instant, f: F) -> CancelToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.timers.schedule_at(deadline, f);
        let _ = self.waker.wake();
        token
    }

    pub fn schedule_after<F>(&self, delay: Duration, f: F) -> CancelToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, f)
    }

    pub fn cancel_timer(&self, token: &CancelToken) {
        self.timers.cancel(token);
    }

    /// Registers `fd` with `ERROR` forced on top of whatever the caller
    /// asked for (spec §4.1, `register_fd`).
    pub fn register_fd<F>(&self, fd: RawFd, interests: Interest, handler: F) -> io::Result<()>
    where
        F: Fn(Interest) -> io::Result<()> + Send + Sync + 'static,
    {
        let interests = interests | Interest::ERROR;
        self.handlers.lock().insert(
            fd,
            HandlerEntry {
                handler: Arc::new(handler),
                interests,
            },
        );
        self.poller.register(fd, Token::from(fd), interests)
    }

    pub fn modify_fd(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let interests = interests | Interest::ERROR;
        let mut handlers = self.handlers.lock();
        if let Some(entry) = handlers.get_mut(&fd) {
            entry.interests = interests;
        }
        self.poller.reregister(fd, Token::from(fd), interests)
    }

    pub fn unregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.handlers.lock().remove(&fd);
        self.poller.unregister(fd)
    }

    /// Runs the main step repeatedly until STOPPED. Fails immediately with
    /// *cross-process-use* if called from a process other than the one
    /// that constructed this loop (spec §5, "Process identity").
    pub fn run(&self) -> Result<(), ClientError> {
        let pid = std::process::id();
        let my_pid = self.pid;
        let started = self
            .lifecycle
            .start(move || -> Result<bool, ClientError> {
                if pid != my_pid {
                    return Err(ClientError::CrossProcessUse);
                }
                Ok(true)
            })?;
        if !started {
            return Err(ClientError::LifecycleWrongState(
                "event loop could not transition out of its current state",
            ));
        }

        // Own wake-up source: always watched, drained every iteration the
        // poll step reports it ready, drives no handler logic itself.
        self.register_fd(self.waker.as_raw_fd(), Interest::READ, |_| Ok(()))
            .map_err(ClientError::Io)?;

        let result = self.main_loop();
        if result.is_err() {
            self.lifecycle.transfer_to_stopping_if_necessary();
            self.lifecycle.transfer_to_stopped();
        }
        result
    }

    fn main_loop(&self) -> Result<(), ClientError> {
        let mut events = Events::with_capacity(1024);
        loop {
            let n = self.callbacks.lock().len();

            let now = Instant::now();
            for cb in self.timers.drain_due(now) {
                self.run_protected("timer callback", cb);
            }

            for _ in 0..n {
                let cb = self.callbacks.lock().pop_front();
                match cb {
                    Some(cb) => self.run_protected("queued callback", cb),
                    None => break,
                }
            }

            if self.lifecycle.is(State::Stopping) {
                self.lifecycle.transfer_to_stopped();
                return Ok(());
            }

            let timeout = self.poll_timeout(Instant::now());
            match self.poller.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Io(e)),
            }

            self.waker.drain();

            for (token, interest) in events.iter() {
                let fd = token.0 as RawFd;
                let entry_handler = { self.handlers.lock().get(&fd).map(|e| e.handler.clone()) };
                // A handler that was unregistered between the poll call and
                // here is simply dropped (spec §4.1 step 7): removals race
                // with reports and that's fine.
                if let Some(handler) = entry_handler {
                    self.run_protected_fd(fd, interest, handler);
                }
            }
        }
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        match self.timers.peek_deadline() {
            Some(deadline) if deadline > now => {
                (deadline - now).min(DEFAULT_POLL_TIMEOUT)
            }
            Some(_) => Duration::from_secs(0),
            None => DEFAULT_POLL_TIMEOUT,
        }
    }

    fn run_protected(&self, context: &str, f: Box<dyn FnOnce() + Send>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let message = panic_message(&payload);
            self.exception_hook
                .handle(context, &io::Error::new(io::ErrorKind::Other, message));
        }
    }

    fn run_protected_fd(&self, fd: RawFd, interest: Interest, handler: FdHandler) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(interest)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(ref e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => self
                .exception_hook
                .handle(&format!("fd handler (fd={fd})"), &e),
            Err(payload) => {
                let message = panic_message(&payload);
                self.exception_hook.handle(
                    &format!("fd handler (fd={fd})"),
                    &io::Error::new(io::ErrorKind::Other, message),
                );
            }
        }
    }

    /// Transitions STARTED -> STOPPING and wakes the loop so the next
    /// iteration observes the request.
    pub fn stop(&self) {
        if self.lifecycle.transfer_to_stopping_if_necessary() {
            let _ = self.waker.wake();
        }
    }

    /// Tears down the waker, poller registration, and timer heap. Only
    /// permissible once STOPPED (spec §4.1, `close`).
    pub fn close(&self, close_all_fds: bool) -> Result<(), ClientError> {
        if !self.lifecycle.is(State::Stopped) {
            return Err(ClientError::LifecycleWrongState(
                "close() is only permitted once the loop is STOPPED",
            ));
        }
        if close_all_fds {
            let fds: Vec<RawFd> = self.handlers.lock().keys().copied().collect();
            for fd in fds {
                let _ = self.unregister_fd(fd);
                unsafe {
                    libc::close(fd);
                }
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn runs_submitted_callback_then_stops() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let ran = Arc::new(AtomicUsize::new(0));

        let el = event_loop.clone();
        let handle = thread::spawn(move || el.run());

        // `run()` transitions asynchronously; spin briefly until STARTED.
        while event_loop.state() != State::Started {
            thread::yield_now();
        }

        let ran_clone = ran.clone();
        event_loop
            .submit_callback(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Give the loop a moment to process, then stop it.
        thread::sleep(Duration::from_millis(50));
        event_loop.stop();
        handle.join().unwrap().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        event_loop.close(false).unwrap();
    }

    #[test]
    fn cancelled_timer_never_invoked() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let token = event_loop.schedule_after(Duration::from_millis(5), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.cancel_timer(&token);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
