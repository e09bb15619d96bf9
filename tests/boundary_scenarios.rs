//! Boundary scenarios enumerated in the design doc's "testable properties"
//! section: queue-full rejection, invalid-body-for-method short-circuiting
//! before the network, a TLS handshake failure surfacing as a synthesized
//! transport error, and a high-volume fan-out across a small worker pool.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use curlmux::{ClientError, Manager, ManagerConfig, Method, Request};

fn spawn_slow_server(delay: Duration) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => return,
            };
            thread::spawn(move || {
                let mut stream = stream;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                thread::sleep(delay);
                let body = b"slow";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
            });
        }
    });
    (format!("http://{addr}"), handle)
}

fn spawn_fast_server(max_conns: usize) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        for stream in listener.incoming().take(max_conns) {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => return,
            };
            thread::spawn(move || {
                let mut stream = stream;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let body = b"ok";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
            });
        }
    });
    (format!("http://{addr}"), handle)
}

/// Scenario 1 (spec §8): with `worker_count=1, max_clients=1`, submitting
/// one more request than `max_queue_size` fulfils exactly one handle with
/// *queue-full*; every other handle still reaches a response.
#[test]
fn submitting_past_queue_capacity_rejects_exactly_the_overflow() {
    let (url, _server) = spawn_fast_server(4);
    let manager = Manager::new(ManagerConfig {
        worker_count: 1,
        max_clients: 1,
        max_queue_size: 3,
    });
    manager.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| manager.submit(Request::builder(url.clone()).build().unwrap()))
        .collect();

    let mut queue_full_count = 0;
    let mut ok_count = 0;
    for handle in handles {
        match handle.wait() {
            Ok(response) => {
                assert_eq!(response.code, 200);
                ok_count += 1;
            }
            Err(ClientError::QueueFull) => queue_full_count += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(queue_full_count, 1);
    assert_eq!(ok_count, 3);
    manager.stop(Duration::from_secs(5));
}

/// Scenario 2 (spec §8): stopping while transfers are in flight against a
/// slow sink fulfils every in-flight handle with *manager-stopped* and
/// returns promptly rather than hanging.
#[test]
fn stop_while_in_flight_fulfils_with_manager_stopped() {
    let (url, _server) = spawn_slow_server(Duration::from_secs(30));
    let manager = Manager::new(ManagerConfig {
        worker_count: 1,
        max_clients: 2,
        max_queue_size: 8,
    });
    manager.start().unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| manager.submit(Request::builder(url.clone()).build().unwrap()))
        .collect();

    // Give the driver a moment to actually dispatch both onto the slow
    // sink before we pull the plug.
    thread::sleep(Duration::from_millis(100));

    let started = std::time::Instant::now();
    manager.stop(Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(5));

    for handle in handles {
        assert_eq!(
            handle.wait().unwrap_err().to_string(),
            ClientError::ManagerStopped.to_string()
        );
    }
}

/// Scenario 3 (spec §8): `method=GET, body="x"` is rejected at build time,
/// before any submission or network activity.
#[test]
fn get_with_body_never_reaches_the_network() {
    let result = Request::builder("http://example.invalid")
        .method(Method::Get)
        .body(b"x".to_vec())
        .build();
    assert!(matches!(result, Err(ClientError::InvalidBodyForMethod { .. })));
}

/// Scenario 4 (spec §8), adapted: `validate_cert=true` against an endpoint
/// that never completes a TLS handshake (a plain-HTTP loopback server
/// answering an `https://` request) fulfils with *transport-error*,
/// synthesized code 599 — exercising the same failure path a rejected
/// self-signed certificate takes in libcurl (`CURLE_SSL_CONNECT_ERROR`).
#[test]
fn tls_handshake_failure_surfaces_as_transport_error() {
    let (url, _server) = spawn_fast_server(1);
    let https_url = url.replacen("http://", "https://", 1);

    let manager = Manager::new(ManagerConfig {
        worker_count: 1,
        max_clients: 1,
        max_queue_size: 4,
    });
    manager.start().unwrap();

    let handle = manager.submit(Request::builder(https_url).build().unwrap());
    match handle.wait() {
        Err(ClientError::TransportError { .. }) => {}
        other => panic!("expected a transport error, got {other:?}"),
    }

    manager.stop(Duration::from_secs(5));
}

/// Scenario 5 (spec §8): a large batch against a fast loopback endpoint all
/// reach a terminal state and the free-list is fully restored afterward.
#[test]
fn large_batch_all_reach_terminal_state() {
    const REQUEST_COUNT: usize = 500;
    let (url, _server) = spawn_fast_server(REQUEST_COUNT);

    let manager = Manager::new(ManagerConfig {
        worker_count: 2,
        max_clients: 25,
        max_queue_size: 1000,
    });
    manager.start().unwrap();

    let handles: Vec<_> = (0..REQUEST_COUNT)
        .map(|_| manager.submit(Request::builder(url.clone()).build().unwrap()))
        .collect();

    let mut ok = 0;
    let mut failed = 0;
    for handle in handles {
        match handle.wait() {
            Ok(response) if response.code == 200 => ok += 1,
            _ => failed += 1,
        }
    }

    assert_eq!(ok + failed, REQUEST_COUNT);
    assert_eq!(failed, 0);
    manager.stop(Duration::from_secs(10));
}
