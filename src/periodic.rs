use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::event_loop::EventLoop;

/// Self-rescheduling timer that resyncs on clock skew (component F, spec
/// §4.5). Grounded on `periodic_callback.py`'s `_schedule_next`.
pub struct PeriodicCallback {
    event_loop: Arc<EventLoop>,
    period: Duration,
    jitter: f64,
    callback: Box<dyn Fn() + Send + Sync>,
    next_deadline: Mutex<Option<Instant>>,
    stopped: AtomicBool,
}

impl PeriodicCallback {
    pub fn new<F>(event_loop: Arc<EventLoop>, period: Duration, callback: F) -> Arc<PeriodicCallback>
    where
        F: Fn() + Send + Sync + 'static,
    {
        PeriodicCallback::with_jitter(event_loop, period, 0.0, callback)
    }

    pub fn with_jitter<F>(
        event_loop: Arc<EventLoop>,
        period: Duration,
        jitter: f64,
        callback: F,
    ) -> Arc<PeriodicCallback>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(PeriodicCallback {
            event_loop,
            period,
            jitter: jitter.clamp(0.0, 1.0),
            callback: Box::new(callback),
            next_deadline: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let first = Instant::now() + self.jittered_period();
        *self.next_deadline.lock() = Some(first);
        self.arm(first);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn arm(self: &Arc<Self>, deadline: Instant) {
        let this = self.clone();
        self.event_loop.schedule_at(deadline, move || this.fire());
    }

    fn fire(self: Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        if panic::catch_unwind(AssertUnwindSafe(|| (self.callback)())).is_err() {
            // Exceptions inside the callback are routed to the event loop's
            // own exception hook via `run_protected`, since this closure
            // runs as a scheduled timer callback; the next tick is still
            // scheduled below regardless.
        }

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let previous = self.next_deadline.lock().unwrap_or_else(Instant::now);
        let next = self.next_tick(previous, Instant::now());
        *self.next_deadline.lock() = Some(next);
        self.arm(next);
    }

    /// Skip ahead to the next period multiple if the callback ran slow
    /// (don't burst); advance by exactly one period if the clock moved
    /// backward (don't spin).
    fn next_tick(&self, previous_deadline: Instant, now: Instant) -> Instant {
        if now < previous_deadline {
            return previous_deadline + self.jittered_period();
        }
        let elapsed = now.duration_since(previous_deadline);
        let period = self.period.max(Duration::from_nanos(1));
        let periods_elapsed = elapsed.as_secs_f64() / period.as_secs_f64();
        let skip = periods_elapsed.floor() as u32 + 1;
        previous_deadline + period * skip + self.jittered_period() - period
    }

    fn jittered_period(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.period;
        }
        // Cheap pseudo-jitter derived from the wall clock's sub-second
        // nanos rather than `rand`, since this runs inside the event loop's
        // timer path and must stay allocation-free and infallible.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0;
        let factor = 1.0 + (nanos - 0.5) * 2.0 * self.jitter;
        self.period.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_callback_skips_ahead_instead_of_bursting() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let period = Duration::from_millis(100);
        let previous = Instant::now();
        // Pretend the callback ran 350ms late: 3 whole periods have
        // elapsed, so the next tick should land 4 periods after `previous`,
        // not fire 3 times back-to-back.
        let now = previous + Duration::from_millis(350);

        let periodic = PeriodicCallback::new(event_loop, period, || {});
        let next = periodic.next_tick(previous, now);
        assert_eq!(next, previous + Duration::from_millis(400));
    }

    #[test]
    fn backward_clock_advances_by_one_period() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let period = Duration::from_millis(100);
        let previous = Instant::now() + Duration::from_millis(200);
        let now = Instant::now();

        let periodic = PeriodicCallback::new(event_loop, period, || {});
        let next = periodic.next_tick(previous, now);
        assert_eq!(next, previous + period);
    }
}
