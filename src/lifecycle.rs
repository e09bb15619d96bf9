use parking_lot::Mutex;

/// Five-state machine from spec §4.3. `STOPPED -> STARTING` is the only
/// re-entry path; every other transition not listed here is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialization,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Guards the lifecycle state behind a plain mutex. Predicate-gated starts
/// release the lock before running the predicate, so the predicate never
/// runs while holding it (grounded on `status.py`'s `_run_predicate`).
pub struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(State::Initialization),
        }
    }

    pub fn current(&self) -> State {
        *self.state.lock()
    }

    pub fn is(&self, state: State) -> bool {
        self.current() == state
    }

    /// Runs `predicate` under a STARTING transition. If `predicate` errors
    /// or returns `false`, the state reverts to whatever it was before the
    /// call; only `Ok(true)` commits to STARTED.
    pub fn start<F, E>(&self, predicate: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<bool, E>,
    {
        let previous = match self.begin_starting() {
            Some(previous) => previous,
            None => return Ok(false),
        };
        self.finish_starting(predicate, previous)
    }

    /// Idempotent start: returns `Ok(true)` immediately if already
    /// STARTING/STARTED, refuses if STOPPING, otherwise behaves like
    /// `start`.
    pub fn ensure_start_once<F, E>(&self, predicate: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<bool, E>,
    {
        let previous = {
            let mut guard = self.state.lock();
            match *guard {
                State::Starting | State::Started => return Ok(true),
                State::Stopping => return Ok(false),
                State::Initialization | State::Stopped => {
                    let previous = *guard;
                    *guard = State::Starting;
                    previous
                }
            }
        };
        self.finish_starting(predicate, previous)
    }

    fn begin_starting(&self) -> Option<State> {
        let mut guard = self.state.lock();
        match *guard {
            State::Initialization | State::Stopped => {
                let previous = *guard;
                *guard = State::Starting;
                Some(previous)
            }
            _ => None,
        }
    }

    fn finish_starting<F, E>(&self, predicate: F, previous: State) -> Result<bool, E>
    where
        F: FnOnce() -> Result<bool, E>,
    {
        match predicate() {
            Ok(true) => {
                *self.state.lock() = State::Started;
                Ok(true)
            }
            Ok(false) => {
                *self.state.lock() = previous;
                Ok(false)
            }
            Err(e) => {
                *self.state.lock() = previous;
                Err(e)
            }
        }
    }

    /// STARTED -> STOPPING; treats an already-STOPPING state as success so
    /// callers on exception paths can call this unconditionally and be
    /// guaranteed to reach STOPPED exactly once.
    pub fn transfer_to_stopping_if_necessary(&self) -> bool {
        let mut guard = self.state.lock();
        match *guard {
            State::Stopping => true,
            State::Started => {
                *guard = State::Stopping;
                true
            }
            _ => false,
        }
    }

    pub fn transfer_to_stopped(&self) -> bool {
        let mut guard = self.state.lock();
        if *guard == State::Stopping {
            *guard = State::Stopped;
            true
        } else {
            false
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}
