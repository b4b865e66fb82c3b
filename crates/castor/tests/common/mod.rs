#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use castor::{Caster, Config, CredentialStore};
use castor_net::{EventLoop, SchedulerHandle};

/// Event loop on its own thread, shut down on drop.
pub struct TestLoop {
    pub handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestLoop {
    pub fn spawn() -> Self {
        let (mut evloop, handle) = EventLoop::new().unwrap();
        let thread = thread::spawn(move || evloop.run());
        Self { handle, thread: Some(thread) }
    }
}

impl Drop for TestLoop {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn caster_with(handle: &SchedulerHandle) -> Arc<Caster> {
    Caster::new(Config::default(), CredentialStore::default(), handle.clone())
}

pub fn wait_until<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Accepts one connection, reads one request head, answers with
/// `response`, and closes. Returns the port and the request head.
pub fn serve_once(response: Vec<u8>) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let head = read_request_head(&mut sock);
        sock.write_all(&response).unwrap();
        head
    });
    (port, server)
}

pub fn read_request_head(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while find_subsequence(&buf, b"\r\n\r\n").is_none() {
        let n = sock.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "client hung up before finishing the request");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Reads one full request (head plus Content-Length body). `None` on
/// a clean close before the next request.
pub fn read_request(sock: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let split = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = sock.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..split]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map_or(0, |v| v.trim().parse().unwrap());
    let mut body = buf[split..].to_vec();
    while body.len() < content_length {
        let n = sock.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some((head, body))
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
