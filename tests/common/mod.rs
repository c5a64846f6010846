//! Shared helpers for the end-to-end tests: logging init and a tiny
//! blocking HTTP/1.1 client.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging. Safe to call multiple times; only initializes
/// once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Spin-waits for `cond` to become true.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A parsed HTTP response as seen on the wire.
#[derive(Debug)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal blocking HTTP/1.1 client for driving the server.
pub struct TestClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set_read_timeout failed");
        stream.set_nodelay(true).expect("set_nodelay failed");
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write failed");
    }

    pub fn request(&mut self, method: &str, path: &str, extra_headers: &str) -> WireResponse {
        self.send_raw(
            format!("{method} {path} HTTP/1.1\r\nHost: test\r\n{extra_headers}\r\n").as_bytes(),
        );
        self.read_response()
    }

    pub fn get(&mut self, path: &str) -> WireResponse {
        self.request("GET", path, "")
    }

    /// Reads one complete response (head + `Content-Length` body).
    pub fn read_response(&mut self) -> WireResponse {
        let head_end = loop {
            if let Some(pos) = find_head_end(&self.pending) {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read failed");
            assert!(n > 0, "connection closed before a complete response head");
            self.pending.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(self.pending[..head_end - 4].to_vec()).expect("ascii head");
        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("status line");
        let mut parts = status_line.splitn(3, ' ');
        assert_eq!(parts.next(), Some("HTTP/1.1"));
        let status: u16 = parts
            .next()
            .expect("status code")
            .parse()
            .expect("numeric status");
        let headers: Vec<(String, String)> = lines
            .map(|line| {
                let (name, value) = line.split_once(':').expect("header colon");
                (name.trim().to_owned(), value.trim().to_owned())
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse().expect("numeric content-length"))
            .expect("response carries Content-Length");

        self.pending.drain(..head_end);
        while self.pending.len() < content_length {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read failed");
            assert!(n > 0, "connection closed mid-body");
            self.pending.extend_from_slice(&chunk[..n]);
        }
        let body: Vec<u8> = self.pending.drain(..content_length).collect();

        WireResponse {
            status,
            headers,
            body,
        }
    }

    /// Returns true if the server closes the connection without sending
    /// any further bytes.
    pub fn expect_eof(&mut self) -> bool {
        let mut chunk = [0u8; 256];
        matches!(self.stream.read(&mut chunk), Ok(0))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
