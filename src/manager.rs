use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::completion::{CompletionHandle, Outcome};
use crate::driver::MultiDriver;
use crate::error::{ClientError, ExceptionHook, LoggingExceptionHook};
use crate::event_loop::EventLoop;
use crate::lifecycle::{Lifecycle, State};
use crate::queue::{Queue, QueuedItem};
use crate::readiness::Interest;
use crate::request::Request;
use crate::sys::Waker;

/// Tuning knobs for a [`Manager`] (component G, spec §4.4). Mirrors
/// `AbstractManager.__init__`/`CurlAsyncHTTPClientManager.__init__`'s
/// keyword arguments in `manager.py`.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub worker_count: usize,
    pub max_queue_size: usize,
    pub max_clients: usize,
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            worker_count: 4,
            max_queue_size: 1000,
            max_clients: 10,
        }
    }
}

struct WorkerHandle {
    event_loop: Arc<EventLoop>,
    waker: Arc<Waker>,
    join: JoinHandle<()>,
}

struct Shared {
    config: ManagerConfig,
    queue: Arc<Queue>,
    lifecycle: Lifecycle,
    workers: Mutex<Vec<WorkerHandle>>,
    quit_count: AtomicUsize,
    exception_hook: Arc<dyn ExceptionHook>,
}

impl Shared {
    /// Mirrors `quit_if_necessary`/`force_quit`: every worker thread calls
    /// this exactly once as its last action. The manager reaches STOPPED
    /// the moment the count catches up with `worker_count`, whichever
    /// thread happens to be last (including one that crashed before `stop`
    /// was ever called).
    fn report_worker_quit(&self) {
        let count = self.quit_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.worker_count {
            self.lifecycle.transfer_to_stopped();
        }
    }
}

/// Fixed worker pool fronted by a bounded FIFO submission queue (component
/// G, spec §4.4). Each worker hosts one [`EventLoop`] and one
/// [`MultiDriver`]; all workers share one [`Queue`]. Grounded on
/// `manager.py`'s `AbstractManager` / `CurlAsyncHTTPClientManager`.
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Manager {
        Manager::with_exception_hook(config, Arc::new(LoggingExceptionHook))
    }

    pub fn with_exception_hook(config: ManagerConfig, exception_hook: Arc<dyn ExceptionHook>) -> Manager {
        Manager {
            shared: Arc::new(Shared {
                queue: Arc::new(Queue::new(config.max_queue_size)),
                config,
                lifecycle: Lifecycle::new(),
                workers: Mutex::new(Vec::new()),
                quit_count: AtomicUsize::new(0),
                exception_hook,
            }),
        }
    }

    pub fn state(&self) -> State {
        self.shared.lifecycle.current()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Spawns `worker_count` worker threads, each initializing its own
    /// `{event_loop, driver}` context and binding its waker fd so that
    /// `driver.wake_up` runs on waker readiness (spec §4.4, `start`).
    /// Idempotent while STARTING/STARTED.
    pub fn start(&self) -> Result<(), ClientError> {
        let shared = self.shared.clone();
        let started = self
            .shared
            .lifecycle
            .ensure_start_once(move || -> Result<bool, ClientError> {
                shared.quit_count.store(0, Ordering::SeqCst);
                let mut workers = Vec::with_capacity(shared.config.worker_count);
                for worker_id in 0..shared.config.worker_count {
                    log::debug!("initializing worker thread #{worker_id}");
                    workers.push(spawn_worker(worker_id, &shared)?);
                }
                *shared.workers.lock() = workers;
                Ok(true)
            })?;
        if !started {
            return Err(ClientError::LifecycleWrongState(
                "manager could not transition out of its current state",
            ));
        }
        Ok(())
    }

    /// Enqueues `request` and returns a handle the caller waits on. Failure
    /// modes fulfil the handle rather than erroring the call, so callers
    /// always get a handle back (spec §4.4, `submit`).
    pub fn submit(&self, request: Request) -> CompletionHandle {
        let handle = CompletionHandle::new();

        if !self.shared.lifecycle.is(State::Started) {
            handle.claim_running();
            handle.fulfill(Outcome::Error(ClientError::ManagerNotStarted));
            return handle;
        }

        let item = QueuedItem {
            request: Arc::new(request),
            completion: handle.clone(),
            submitted_at: Instant::now(),
        };
        if let Err(item) = self.shared.queue.try_push(item) {
            item.completion.claim_running();
            item.completion.fulfill(Outcome::Error(ClientError::QueueFull));
            return handle;
        }

        self.wake_all_workers();
        handle
    }

    /// Broadcasts to every worker's waker; exactly one will win the race to
    /// pop the item, the rest observe an empty queue (spec §4.4,
    /// "Fairness").
    fn wake_all_workers(&self) {
        for worker in self.shared.workers.lock().iter() {
            let _ = worker.waker.wake();
        }
    }

    /// STARTED -> STOPPING; stops and joins every worker (each bounded by
    /// `timeout` individually, not in aggregate), then drains the queue,
    /// fulfilling every remaining handle with *manager-stopped* (spec §4.4,
    /// `stop`; spec §5, "Manager stop(timeout) applies... individually").
    pub fn stop(&self, timeout: Duration) {
        if !self.shared.lifecycle.transfer_to_stopping_if_necessary() {
            return;
        }

        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in &workers {
            worker.event_loop.stop();
            let _ = worker.waker.wake();
        }
        for worker in workers {
            let label = format!("{:?}", worker.join.thread().id());
            if join_with_timeout(worker.join, timeout) {
                log::debug!("worker {label} stopped cleanly");
            } else {
                log::error!("worker {label} did not stop within {timeout:?}");
            }
        }

        for item in self.shared.queue.drain() {
            item.completion.claim_running();
            item.completion.fulfill(Outcome::Error(ClientError::ManagerStopped));
        }
    }
}

fn spawn_worker(worker_id: usize, shared: &Arc<Shared>) -> Result<WorkerHandle, ClientError> {
    let event_loop = Arc::new(EventLoop::with_exception_hook(shared.exception_hook.clone()).map_err(ClientError::Io)?);
    let waker = Arc::new(Waker::new().map_err(ClientError::Io)?);
    let driver = Arc::new(MultiDriver::new(
        event_loop.clone(),
        shared.queue.clone(),
        shared.config.max_clients,
        shared.exception_hook.clone(),
    )?);

    let wake_driver = driver.clone();
    event_loop
        .register_fd(waker.as_raw_fd(), Interest::READ, move |_| {
            wake_driver.wake_up();
            Ok(())
        })
        .map_err(ClientError::Io)?;

    let run_loop = event_loop.clone();
    let run_driver = driver.clone();
    let run_shared = shared.clone();
    let join = thread::Builder::new()
        .name(format!("worker-{worker_id}"))
        .spawn(move || {
            let result = run_loop.run();
            let crashed = result.is_err();
            if let Err(e) = &result {
                run_shared
                    .exception_hook
                    .handle(&format!("worker-{worker_id} event loop"), e);
                // A worker that dies without anyone calling `stop()` yet
                // still has to push the manager toward shutdown, so `stop`
                // never hangs waiting on a dead worker's quorum report
                // (spec §4.4, "Clean-up quorum").
                run_shared.lifecycle.transfer_to_stopping_if_necessary();
            }

            run_driver.close();
            let _ = run_loop.close(true);
            run_shared.report_worker_quit();

            if crashed {
                log::error!("worker-{worker_id} exited unexpectedly");
            } else {
                log::debug!("worker-{worker_id} exited cleanly");
            }
        })
        .map_err(ClientError::Io)?;

    Ok(WorkerHandle { event_loop, waker, join })
}

/// `JoinHandle::join` has no timeout; park the join on a watcher thread and
/// bound how long we wait for it to report back (spec §4.4, `stop(timeout)`
/// must not hang on a wedged worker). Returns whether the worker finished
/// within `timeout`; a worker that doesn't is left running and simply
/// logged, mirroring `thread.isAlive()` in `manager.py`'s `stop`.
fn join_with_timeout(join: JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let watcher = thread::spawn(move || {
        let _ = join.join();
        let _ = tx.send(());
    });
    if rx.recv_timeout(timeout).is_ok() {
        let _ = watcher.join();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn spawn_loopback_ok_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let body = b"ok";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
                return;
            }
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn submit_before_start_is_rejected() {
        let manager = Manager::new(ManagerConfig {
            worker_count: 1,
            max_queue_size: 4,
            max_clients: 1,
        });
        let request = Request::builder("http://example.com").build().unwrap();
        let handle = manager.submit(request);
        assert_eq!(
            handle.wait().unwrap_err().to_string(),
            ClientError::ManagerNotStarted.to_string()
        );
    }

    #[test]
    fn queue_full_is_reported_without_blocking() {
        let manager = Manager::new(ManagerConfig {
            worker_count: 1,
            max_queue_size: 0,
            max_clients: 1,
        });
        manager.start().unwrap();
        let request = Request::builder("http://example.invalid").build().unwrap();
        let handle = manager.submit(request);
        let result = handle.wait();
        assert!(result.is_err());
        manager.stop(Duration::from_secs(5));
    }

    #[test]
    fn round_trip_against_loopback_server() {
        let (url, server) = spawn_loopback_ok_server();
        let manager = Manager::new(ManagerConfig {
            worker_count: 1,
            max_queue_size: 4,
            max_clients: 1,
        });
        manager.start().unwrap();
        let request = Request::builder(url).build().unwrap();
        let handle = manager.submit(request);
        let response = handle.wait().unwrap();
        assert_eq!(response.code, 200);
        manager.stop(Duration::from_secs(5));
        server.join().unwrap();
    }

    #[test]
    fn stop_fulfils_queued_items_with_manager_stopped() {
        let manager = Manager::new(ManagerConfig {
            worker_count: 1,
            max_queue_size: 4,
            max_clients: 0,
        });
        manager.start().unwrap();
        let request = Request::builder("http://example.invalid").build().unwrap();
        let handle = manager.submit(request);
        manager.stop(Duration::from_secs(5));
        assert_eq!(
            handle.wait().unwrap_err().to_string(),
            ClientError::ManagerStopped.to_string()
        );
    }
}
