use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Compaction fires only once cancelled entries both exceed this count and
/// exceed half the heap (spec §3, Timer Entry).
const COMPACTION_THRESHOLD: usize = 512;

struct Shared {
    callback: Mutex<Option<Callback>>,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    shared: Arc<Shared>,
}

// Reversed so `BinaryHeap`, a max-heap, pops the smallest (deadline, seq)
// pair first - i.e. behaves as a min-heap.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Opaque handle returned by `schedule_at`/`schedule_after`, usable to
/// cancel the entry before it fires.
#[derive(Clone)]
pub struct CancelToken(Arc<Shared>);

/// Min-heap of pending timers with tombstone-based cancellation (spec §3,
/// "Timer Entry"). Guarded internally so the event loop's timer lock maps
/// directly onto this type.
pub struct TimerHeap {
    heap: Mutex<BinaryHeap<Entry>>,
    cancellations: AtomicUsize,
    seq: AtomicU64,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            heap: Mutex::new(BinaryHeap::new()),
            cancellations: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        }
    }

    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> CancelToken
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            callback: Mutex::new(Some(Box::new(callback))),
        });
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(Entry {
            deadline,
            seq,
            shared: shared.clone(),
        });
        CancelToken(shared)
    }

    pub fn cancel(&self, token: &CancelToken) {
        let mut guard = token.0.callback.lock();
        if guard.take().is_some() {
            self.cancellations.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Root deadline of the heap, tombstoned or not. Only meaningful right
    /// after `drain_due`, which guarantees the root is neither cancelled nor
    /// already due (spec §8 invariant: root deadline ≤ all live deadlines).
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|e| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Pop tombstones lazily off the top, then pop every entry due at or
    /// before `now`, compacting if cancelled entries have piled up (spec
    /// §4.1 main step, "Scheduling pass").
    pub fn drain_due(&self, now: Instant) -> Vec<Callback> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();

        loop {
            let (shared, deadline) = match heap.peek() {
                None => break,
                Some(top) => (top.shared.clone(), top.deadline),
            };

            let mut cb_guard = shared.callback.lock();
            if cb_guard.is_none() {
                drop(cb_guard);
                heap.pop();
                self.cancellations
                    .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |v| {
                        Some(v.saturating_sub(1))
                    })
                    .ok();
                continue;
            }

            if deadline <= now {
                let cb = cb_guard.take().unwrap();
                drop(cb_guard);
                heap.pop();
                due.push(cb);
                continue;
            }

            break;
        }

        let cancellations = self.cancellations.load(AtomicOrdering::Relaxed);
        if cancellations > COMPACTION_THRESHOLD && cancellations * 2 > heap.len() {
            let live: Vec<Entry> = heap
                .drain()
                .filter(|e| e.shared.callback.lock().is_some())
                .collect();
            *heap = live.into_iter().collect();
            self.cancellations.store(0, AtomicOrdering::Relaxed);
        }

        due
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        TimerHeap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn fires_due_entries_in_deadline_order() {
        let heap = TimerHeap::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now();

        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            heap.schedule_at(base + Duration::from_millis(delay), move || {
                order.lock().push(i);
            });
        }

        let due = heap.drain_due(base + Duration::from_millis(100));
        assert_eq!(due.len(), 3);
        for cb in due {
            cb();
        }
        assert_eq!(*order.lock(), vec![1, 2, 0]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let heap = TimerHeap::new();
        let fired = Arc::new(AtomicBool::new(false));
        let base = Instant::now();
        let fired_clone = fired.clone();
        let token = heap.schedule_at(base + Duration::from_millis(5), move || {
            fired_clone.store(true, AtomicOrdering::SeqCst);
        });
        heap.cancel(&token);

        let due = heap.drain_due(base + Duration::from_secs(1));
        assert!(due.is_empty());
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn root_deadline_never_exceeds_live_deadlines() {
        let heap = TimerHeap::new();
        let base = Instant::now();
        let deadlines = [
            base + Duration::from_millis(50),
            base + Duration::from_millis(10),
            base + Duration::from_millis(30),
        ];
        for d in deadlines {
            heap.schedule_at(d, || {});
        }
        heap.drain_due(base);
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_millis(10)));
    }

    #[test]
    fn not_yet_due_entries_stay_in_heap() {
        let heap = TimerHeap::new();
        let base = Instant::now();
        heap.schedule_at(base + Duration::from_secs(10), || {});
        let due = heap.drain_due(base);
        assert!(due.is_empty());
        assert!(!heap.is_empty());
    }
}
