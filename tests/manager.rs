//! Manager lifecycle and fan-out behavior against a real loopback server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use curlmux::{Manager, ManagerConfig};

#[test]
fn start_is_idempotent_and_restart_after_stop_works() {
    let manager = Manager::new(ManagerConfig {
        worker_count: 2,
        max_queue_size: 16,
        max_clients: 4,
    });
    manager.start().unwrap();
    manager.start().unwrap(); // idempotent while STARTED
    manager.stop(Duration::from_secs(5));
    // STOPPED -> STARTING is the one permitted re-entry path.
    manager.start().unwrap();
    manager.stop(Duration::from_secs(5));
}

#[test]
fn many_requests_fan_out_across_workers() {
    let (url, _server) = spawn_ok_server_multi();
    let manager = Manager::new(ManagerConfig {
        worker_count: 3,
        max_queue_size: 64,
        max_clients: 8,
    });
    manager.start().unwrap();

    let handles: Vec<_> = (0..30).map(|_| manager.submit(request(&url))).collect();
    for handle in handles {
        let response = handle.wait().unwrap();
        assert_eq!(response.code, 200);
    }

    manager.stop(Duration::from_secs(5));
}

fn request(url: &str) -> curlmux::Request {
    curlmux::Request::builder(url).build().unwrap()
}

/// Like `spawn_ok_server` but serves an unbounded number of connections on
/// background threads, for tests that submit more than one request.
fn spawn_ok_server_multi() -> (String, thread::JoinHandle<()>) {
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
