use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use curl::easy::{Easy2, List};
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};
use parking_lot::Mutex;

use crate::completion::Outcome;
use crate::error::{ClientError, ExceptionHook};
use crate::event_loop::EventLoop;
use crate::queue::Queue;
use crate::readiness::Interest;
use crate::request::{AuthMode, Request};
use crate::response::{Response, TimingInfo};
use crate::timer::CancelToken;
use crate::transfer::{TransferContext, TransferHandler};

/// libcurl's `CURL_SOCKET_TIMEOUT` sentinel: the socket value passed to
/// `curl_multi_socket_action` to mean "no fd is ready, just reassess
/// timeouts" (spec §4.2, `action(SOCKET_TIMEOUT, 0)`).
const SOCKET_TIMEOUT: Socket = -1;

/// Belt-and-braces rescan interval covering library bugs that silently
/// drop a socket or timer callback (spec §4.2, "Periodic safety net").
const SAFETY_NET_INTERVAL: Duration = Duration::from_millis(500);

/// Bridges libcurl's multi-interface socket/timer callbacks to an
/// [`EventLoop`], owning a fixed-capacity pool of reusable easy handles
/// (component E, spec §4.2).
pub struct MultiDriver {
    inner: Arc<Inner>,
}

struct Inner {
    multi: Multi,
    max_clients: usize,
    free: Mutex<Vec<Easy2<TransferHandler>>>,
    in_flight: Mutex<HashMap<usize, Easy2Handle<TransferHandler>>>,
    next_token: AtomicUsize,
    tracked_fds: Mutex<HashMap<RawFd, ()>>,
    driver_timeout: Mutex<Option<CancelToken>>,
    safety_net: Mutex<Option<CancelToken>>,
    event_loop: Arc<EventLoop>,
    queue: Arc<Queue>,
    exception_hook: Arc<dyn ExceptionHook>,
}

// `Multi`, `Easy2Handle`, and `Easy2` hold raw libcurl pointers and so are
// not `Send`/`Sync` by default, but every field that touches them here is
// behind a `Mutex` (or only ever accessed from the single event-loop thread
// per spec's "single-threaded-cooperative scheduler" contract), matching
// how libcurl's multi-interface is documented to be safely driven.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl MultiDriver {
    pub fn new(
        event_loop: Arc<EventLoop>,
        queue: Arc<Queue>,
        max_clients: usize,
        exception_hook: Arc<dyn ExceptionHook>,
    ) -> Result<MultiDriver, ClientError> {
        let multi = Multi::new();
        let free = (0..max_clients)
            .map(|_| Easy2::new(TransferHandler::new()))
            .collect();

        let inner = Arc::new(Inner {
            multi,
            max_clients,
            free: Mutex::new(free),
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            tracked_fds: Mutex::new(HashMap::new()),
            driver_timeout: Mutex::new(None),
            safety_net: Mutex::new(None),
            event_loop,
            queue,
            exception_hook,
        });

        let socket_weak = Arc::downgrade(&inner);
        inner
            .multi
            .socket_function(move |socket, events, _token| {
                if let Some(inner) = socket_weak.upgrade() {
                    inner.on_socket_event(socket, events);
                }
            })
            .map_err(|e| ClientError::SetupError(e.into()))?;

        let timer_weak = Arc::downgrade(&inner);
        inner
            .multi
            .timer_function(move |timeout_ms| {
                if let Some(inner) = timer_weak.upgrade() {
                    let timeout_ms = match timeout_ms {
                        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
                        None => -1,
                    };
                    inner.on_timer(timeout_ms);
                }
                true
            })
            .map_err(|e| ClientError::SetupError(e.into()))?;

        inner.arm_safety_net();

        Ok(MultiDriver { inner })
    }

    /// Registers the worker's waker fd readiness as "drain the queue and
    /// run a dispatch pass" (spec §4.2, "Wake path").
    pub fn wake_up(&self) {
        self.inner.dispatch();
        let inner = self.inner.clone();
        self.inner
            .event_loop
            .schedule_after(Duration::from_millis(0), move || {
                inner.poke();
            });
    }

    pub fn dispatch(&self) {
        self.inner.dispatch();
    }

    /// Closes every transfer handle and the library handle, fulfilling any
    /// still-in-flight completion with *manager-stopped* (spec §4.2,
    /// "Shutdown").
    pub fn close(&self) {
        if let Some(token) = self.inner.safety_net.lock().take() {
            self.inner.event_loop.cancel_timer(&token);
        }
        if let Some(token) = self.inner.driver_timeout.lock().take() {
            self.inner.event_loop.cancel_timer(&token);
        }

        let fds: Vec<RawFd> = self.inner.tracked_fds.lock().keys().copied().collect();
        for fd in fds {
            let _ = self.inner.event_loop.unregister_fd(fd);
        }

        let in_flight: Vec<(usize, Easy2Handle<TransferHandler>)> =
            self.inner.in_flight.lock().drain().collect();
        for (_token, handle) in in_flight {
            if let Ok(mut easy) = self.inner.multi.remove2(handle) {
                if let Some(context) = easy.get_mut().take_context() {
                    context.completion.fulfill(Outcome::Error(ClientError::ManagerStopped));
                }
            }
        }
    }

    /// Number of handles currently sitting unused in the free-list.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Number of handles currently registered with the multi-interface.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn max_clients(&self) -> usize {
        self.inner.max_clients
    }
}

impl Inner {
    fn on_socket_event(self: &Arc<Self>, socket: Socket, events: SocketEvents) {
        let fd = socket as RawFd;

        if events.remove() {
            self.tracked_fds.lock().remove(&fd);
            let _ = self.event_loop.unregister_fd(fd);
            return;
        }

        let mut interests = Interest::empty();
        if events.input() {
            interests |= Interest::READ;
        }
        if events.output() {
            interests |= Interest::WRITE;
        }

        // Always unregister-then-register rather than modify in place: the
        // library may close and reopen an fd with the same numeric value
        // between callbacks (spec §4.2, "Fd bridging policy").
        let was_tracked = self.tracked_fds.lock().remove(&fd).is_some();
        if was_tracked {
            let _ = self.event_loop.unregister_fd(fd);
        }

        let this = self.clone();
        let register_result = self.event_loop.register_fd(fd, interests, move |ready| {
            this.on_fd_ready(fd, ready);
            Ok(())
        });
        if register_result.is_ok() {
            self.tracked_fds.lock().insert(fd, ());
        }
    }

    fn on_fd_ready(self: &Arc<Self>, fd: RawFd, ready: Interest) {
        let mut events = Events::new();
        events.input(ready.is_readable());
        events.output(ready.is_writable());
        events.error(ready.is_error());

        if let Err(e) = self.multi.action(fd as Socket, &events) {
            self.exception_hook.handle("multi action (fd)", &e);
        }
        self.drain_completions();
        self.dispatch();
    }

    fn on_timer(self: &Arc<Self>, timeout_ms: i32) {
        if let Some(token) = self.driver_timeout.lock().take() {
            self.event_loop.cancel_timer(&token);
        }

        if timeout_ms < 0 {
            return;
        }

        let this = self.clone();
        let token = self
            .event_loop
            .schedule_after(Duration::from_millis(timeout_ms as u64), move || {
                this.fire_timeout();
            });
        *self.driver_timeout.lock() = Some(token);
    }

    fn fire_timeout(self: &Arc<Self>) {
        if let Err(e) = self.multi.action(SOCKET_TIMEOUT, &Events::new()) {
            self.exception_hook.handle("multi action (timeout)", &e);
        }
        self.drain_completions();

        // Resync wall-clock drift: ask the library for its next timeout
        // rather than assuming none is pending (spec §4.2, "Timer bridging
        // policy").
        if let Ok(Some(next)) = self.multi.get_timeout() {
            self.on_timer(next.as_millis().min(i32::MAX as u128) as i32);
        }

        self.dispatch();
    }

    fn arm_safety_net(self: &Arc<Self>) {
        let this = self.clone();
        let token = self
            .event_loop
            .schedule_after(SAFETY_NET_INTERVAL, move || {
                this.safety_net_sweep();
            });
        *self.safety_net.lock() = Some(token);
    }

    fn safety_net_sweep(self: &Arc<Self>) {
        let fds: Vec<RawFd> = self.tracked_fds.lock().keys().copied().collect();
        for fd in fds {
            let mut events = Events::new();
            events.input(true);
            events.output(true);
            events.error(true);
            if let Err(e) = self.multi.action(fd as Socket, &events) {
                self.exception_hook.handle("safety-net sweep", &e);
            }
        }
        if let Err(e) = self.multi.action(SOCKET_TIMEOUT, &Events::new()) {
            self.exception_hook.handle("safety-net sweep", &e);
        }
        self.drain_completions();
        self.dispatch();
        self.arm_safety_net();
    }

    fn poke(self: &Arc<Self>) {
        if let Err(e) = self.multi.action(SOCKET_TIMEOUT, &Events::new()) {
            self.exception_hook.handle("wake poke", &e);
        }
        self.drain_completions();
        self.dispatch();
    }

    /// Pairs queued items with free handles up to `max_clients` (spec
    /// §4.2, "Dispatch").
    fn dispatch(self: &Arc<Self>) {
        let mut added_any = false;
        loop {
            let has_free = !self.free.lock().is_empty();
            if !has_free {
                break;
            }
            let item = match self.queue.pop() {
                Some(item) => item,
                None => break,
            };

            if !item.completion.claim_running() {
                // Cancelled before dispatch: no Response is ever
                // constructed, the handle never left the free-list (spec
                // §8, boundary scenario 6).
                continue;
            }

            let mut easy = self.free.lock().pop().expect("checked non-empty above");
            let context = TransferContext {
                request: item.request.clone(),
                completion: item.completion.clone(),
                submit_time: item.submitted_at,
                dispatch_wall_time: Instant::now(),
            };
            easy.get_mut().bind(context);

            if let Err(e) = apply_request(&mut easy, &item.request) {
                easy.get_mut().take_context();
                self.free.lock().push(easy);
                item.completion
                    .fulfill(Outcome::Error(ClientError::SetupError(e)));
                continue;
            }

            if let Some(cb) = &item.request.prepare_curl_callback {
                cb(&mut easy);
            }

            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            match self.multi.add2(easy) {
                Ok(handle) => {
                    self.in_flight.lock().insert(token, handle);
                    added_any = true;
                }
                Err(e) => {
                    // `add2` consumes the easy handle even on failure and
                    // curl-rust has no way to hand it back; this is the one
                    // path where the free/in-flight partition can't be kept
                    // whole (spec §4.2, "Setup errors must NOT leak
                    // handles" covers option materialization, not this).
                    self.exception_hook.handle("multi add_handle", &e);
                    item.completion.fulfill(Outcome::Error(ClientError::TransportError {
                        errno: -1,
                        message: e.to_string(),
                    }));
                }
            }
        }

        if added_any {
            // Immediately reassess so a library that was idle because it
            // thought nothing was pending gets nudged (spec §4.2, "Wake
            // path").
            let this = self.clone();
            self.event_loop
                .schedule_after(Duration::from_millis(0), move || this.poke_once());
        }
    }

    fn poke_once(self: &Arc<Self>) {
        if let Err(e) = self.multi.action(SOCKET_TIMEOUT, &Events::new()) {
            self.exception_hook.handle("dispatch poke", &e);
        }
        self.drain_completions();
    }

    fn drain_completions(self: &Arc<Self>) {
        let mut completed: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        {
            let in_flight = self.in_flight.lock();
            self.multi.messages(|message| {
                for (&token, handle) in in_flight.iter() {
                    if let Some(result) = message.result_for2(handle) {
                        completed.push((token, result));
                        break;
                    }
                }
            });
        }

        let any_completed = !completed.is_empty();
        for (token, result) in completed {
            self.complete(token, result);
        }

        if any_completed {
            // Backfill from the queue now that a handle may have freed up.
            self.dispatch();
        }
    }

    fn complete(self: &Arc<Self>, token: usize, result: Result<(), curl::Error>) {
        let handle = match self.in_flight.lock().remove(&token) {
            Some(handle) => handle,
            None => return,
        };

        let mut easy = match self.multi.remove2(handle) {
            Ok(easy) => easy,
            Err(e) => {
                self.exception_hook.handle("multi remove_handle", &e);
                return;
            }
        };

        let context = match easy.get_mut().take_context() {
            Some(ctx) => ctx,
            None => {
                self.free.lock().push(easy);
                return;
            }
        };

        let outcome = build_outcome(&mut easy, &context, result);
        self.free.lock().push(easy);

        context.completion.fulfill(outcome);
    }
}

fn build_outcome(
    easy: &mut Easy2<TransferHandler>,
    context: &TransferContext,
    result: Result<(), curl::Error>,
) -> Outcome {
    if let Err(e) = result {
        // Library-reported failure: nothing about the response is
        // trustworthy, so the handle fulfils with a synthetic-599 error
        // rather than a Response (spec §4.2 step 3, §7 "transport-error").
        return Outcome::Error(ClientError::TransportError {
            errno: e.code() as i32,
            message: e.to_string(),
        });
    }

    let code = easy.response_code().unwrap_or(0);
    let effective_url = easy
        .effective_url()
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_string();
    let primary_ip = easy.primary_ip().ok().flatten().map(|s| s.to_string());
    let speed_download = easy.download_speed().unwrap_or(0.0);
    let speed_upload = easy.upload_speed().unwrap_or(0.0);

    let time_info = TimingInfo {
        queue: context.dispatch_wall_time.saturating_duration_since(context.submit_time),
        namelookup: easy.namelookup_time().unwrap_or_default(),
        connect: easy.connect_time().unwrap_or_default(),
        appconnect: easy.appconnect_time().unwrap_or_default(),
        pretransfer: easy.pretransfer_time().unwrap_or_default(),
        starttransfer: easy.starttransfer_time().unwrap_or_default(),
        total: easy.total_time().unwrap_or_default(),
        redirect: easy.redirect_time().unwrap_or_default(),
    };

    let handler = easy.get_mut();
    let headers: Vec<(String, String)> = handler.headers().to_vec();
    let body_exceeded = handler.body_exceeded();
    let body = if context.request.streaming_callback.is_some() {
        None
    } else {
        Some(handler.take_body())
    };

    let request_time = context.dispatch_wall_time.elapsed();
    let reason = headers
        .iter()
        .find(|(k, _)| k == "X-Http-Reason")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    if body_exceeded {
        return Outcome::Error(ClientError::TransportError {
            errno: -1,
            message: "response body exceeded max_body_length".to_string(),
        });
    }

    let mut response = Response {
        request: context.request.clone(),
        code,
        reason,
        headers,
        body,
        effective_url,
        error: None,
        request_time,
        start_time: context.dispatch_wall_time,
        time_info,
        primary_ip,
        speed_download,
        speed_upload,
    };

    // A non-2xx response is still a successful transfer from the transfer
    // library's point of view; it fulfils as a Response, not an Error, but
    // carries a non-null error so `rethrow()` raises (spec §6, "Response").
    if !(200..300).contains(&code) {
        let snapshot = response.clone();
        response.error = Some(Arc::new(ClientError::HttpStatusError {
            code,
            reason: snapshot.reason.clone(),
            response: Box::new(snapshot),
        }));
    }

    Outcome::Response(response)
}

fn apply_request(easy: &mut Easy2<TransferHandler>, request: &Request) -> Result<(), curl::Error> {
    easy.url(&request.url)?;

    match request.method_str() {
        "GET" => easy.get(true)?,
        "HEAD" => easy.nobody(true)?,
        "POST" => {
            easy.post(true)?;
            easy.post_fields_copy(request.body.as_deref().unwrap_or(&[]))?;
        }
        "PUT" => {
            easy.custom_request("PUT")?;
            easy.post_fields_copy(request.body.as_deref().unwrap_or(&[]))?;
        }
        other => {
            easy.custom_request(other)?;
            if let Some(body) = &request.body {
                easy.post_fields_copy(body)?;
            }
        }
    }

    let mut list = List::new();
    for (name, value) in &request.headers {
        list.append(&format!("{name}: {value}"))?;
    }
    easy.http_headers(list)?;

    easy.connect_timeout(request.connect_timeout)?;
    easy.timeout(request.request_timeout)?;
    easy.follow_location(request.follow_redirects)?;
    easy.max_redirections(request.max_redirects)?;
    easy.useragent(&request.user_agent)?;

    if let Some(iface) = &request.network_interface {
        easy.interface(iface)?;
    }

    easy.accept_encoding(if request.decompress_response {
        "gzip, deflate"
    } else {
        ""
    })?;

    if let Some(host) = &request.proxy_host {
        easy.proxy(host)?;
        if let Some(port) = request.proxy_port {
            easy.proxy_port(port)?;
        }
        if let Some(user) = &request.proxy_username {
            easy.proxy_username(user)?;
        }
        if let Some(pass) = &request.proxy_password {
            easy.proxy_password(pass)?;
        }
        if let Some(mode) = request.proxy_auth_mode {
            easy.proxy_auth(&auth_to_curl(mode))?;
        }
    }

    easy.ssl_verify_peer(request.validate_cert)?;
    easy.ssl_verify_host(request.validate_cert)?;
    if let Some(ca) = &request.ca_certs {
        easy.cainfo(ca)?;
    }
    if let Some(cert) = &request.client_cert {
        easy.ssl_cert(cert)?;
    }
    if let Some(key) = &request.client_key {
        easy.ssl_key(key)?;
    }

    easy.ip_resolve(if request.allow_ipv6 {
        curl::easy::IpResolve::Any
    } else {
        curl::easy::IpResolve::V4
    })?;

    if let Some(user) = &request.auth_username {
        easy.username(user)?;
    }
    if let Some(pass) = &request.auth_password {
        easy.password(pass)?;
    }
    if let Some(mode) = request.auth_mode {
        easy.http_auth(&auth_to_curl(mode))?;
    }

    if !request.resolve_list.is_empty() || !request.connect_to_list.is_empty() {
        let mut resolve = List::new();
        for entry in request.resolve_list.iter().chain(request.connect_to_list.iter()) {
            resolve.append(&format!("{}:{}:{}", entry.host, entry.port, entry.addr))?;
        }
        easy.resolve(resolve)?;
    }

    if let Some(servers) = &request.dns_servers {
        easy.dns_servers(servers)?;
    }
    easy.dns_cache_timeout(request.dns_cache_timeout)?;

    Ok(())
}

fn auth_to_curl(mode: AuthMode) -> curl::easy::Auth {
    let mut auth = curl::easy::Auth::new();
    match mode {
        AuthMode::Basic => auth.basic(true),
        AuthMode::Digest => auth.digest(true),
    };
    auth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionHandle;
    use crate::error::LoggingExceptionHook;
    use crate::queue::QueuedItem;

    fn driver(max_clients: usize) -> MultiDriver {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let queue = Arc::new(Queue::new(4));
        MultiDriver::new(event_loop, queue, max_clients, Arc::new(LoggingExceptionHook)).unwrap()
    }

    #[test]
    fn free_and_in_flight_partition_max_clients_at_construction() {
        let driver = driver(3);
        assert_eq!(driver.max_clients(), 3);
        assert_eq!(driver.free_count() + driver.in_flight_count(), 3);
        assert_eq!(driver.in_flight_count(), 0);
    }

    #[test]
    fn cancelled_before_dispatch_never_constructs_response() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let queue = Arc::new(Queue::new(4));
        let driver = MultiDriver::new(
            event_loop,
            queue.clone(),
            1,
            Arc::new(LoggingExceptionHook),
        )
        .unwrap();

        let completion = CompletionHandle::new();
        let item = QueuedItem {
            request: Arc::new(Request::builder("http://example.com").build().unwrap()),
            completion: completion.clone(),
            submitted_at: Instant::now(),
        };
        queue.try_push(item).unwrap();
        assert!(completion.cancel());

        driver.dispatch();

        // The cancelled item was popped (the queue drained it) but never
        // claimed a handle: the free-list is untouched (spec §8, boundary
        // scenario 6).
        assert_eq!(driver.free_count(), 1);
        assert_eq!(driver.in_flight_count(), 0);
        assert!(completion.wait().is_err());
    }
}
