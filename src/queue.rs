use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::completion::CompletionHandle;
use crate::request::Request;

/// `(Request, Completion Handle, submit-timestamp)` (spec §3, "Queued
/// Item"). Lives in the shared FIFO queue guarded by a mutex; consumed at
/// most once by a worker.
pub struct QueuedItem {
    pub request: Arc<Request>,
    pub completion: CompletionHandle,
    pub submitted_at: Instant,
}

/// Bounded FIFO submission queue guarded by a single mutex (spec §5,
/// "Queue mutex: guards the submission queue only").
pub struct Queue {
    max_size: usize,
    items: Mutex<VecDeque<QueuedItem>>,
}

impl Queue {
    pub fn new(max_size: usize) -> Queue {
        Queue {
            max_size,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically checks capacity and enqueues. `Err` means the caller must
    /// fulfil the handle with *queue-full* themselves (spec §4.4, `submit`).
    pub fn try_push(&self, item: QueuedItem) -> Result<(), QueuedItem> {
        let mut items = self.items.lock();
        if items.len() >= self.max_size {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Pops one item FIFO, or `None` if empty. Only workers call this
    /// (spec §4.4, `get_request`).
    pub fn pop(&self) -> Option<QueuedItem> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Pops every remaining item, for shutdown draining (spec §4.4,
    /// `stop`).
    pub fn drain(&self) -> Vec<QueuedItem> {
        self.items.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    fn item() -> QueuedItem {
        QueuedItem {
            request: Arc::new(Request::builder("http://example.com").build().unwrap()),
            completion: CompletionHandle::new(),
            submitted_at: Instant::now(),
        }
    }

    #[test]
    fn rejects_push_at_capacity() {
        let queue = Queue::new(1);
        assert!(queue.try_push(item()).is_ok());
        assert!(queue.try_push(item()).is_err());
    }

    #[test]
    fn pop_is_fifo() {
        let queue = Queue::new(2);
        let a = Arc::new(Request::builder("http://a.example").build().unwrap());
        let b = Arc::new(Request::builder("http://b.example").build().unwrap());
        queue
            .try_push(QueuedItem {
                request: a.clone(),
                completion: CompletionHandle::new(),
                submitted_at: Instant::now(),
            })
            .unwrap();
        queue
            .try_push(QueuedItem {
                request: b.clone(),
                completion: CompletionHandle::new(),
                submitted_at: Instant::now(),
            })
            .unwrap();

        assert_eq!(queue.pop().unwrap().request.url, a.url);
        assert_eq!(queue.pop().unwrap().request.url, b.url);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = Queue::new(4);
        queue.try_push(item()).unwrap();
        queue.try_push(item()).unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
