//! Property test: rendering a response and parsing it back off the wire
//! preserves the response.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use weft::buffer::BufferPool;
use weft::http::date::CommonHeaders;
use weft::http::response::render_response;
use weft::{HttpResponse, ServerStats};

/// A response head + body as decoded from rendered bytes.
struct Decoded {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn decode(bytes: &[u8]) -> Decoded {
    let head_end = bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("head terminator")
        + 4;
    let head = std::str::from_utf8(&bytes[..head_end - 4]).expect("ascii head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let mut parts = status_line.splitn(3, ' ');
    assert_eq!(parts.next(), Some("HTTP/1.1"));
    let status: u16 = parts.next().expect("code").parse().expect("numeric code");
    let headers = lines
        .map(|line| {
            let (name, value) = line.split_once(':').expect("header colon");
            (name.to_owned(), value.trim().to_owned())
        })
        .collect();
    Decoded {
        status,
        headers,
        body: bytes[head_end..].to_vec(),
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn status_strategy() -> impl Strategy<Value = u16> {
    prop::sample::select(vec![200u16, 204, 301, 400, 404, 418, 500, 503])
}

fn headers_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::hash_map(
        "[A-Za-z][A-Za-z0-9-]{0,14}",
        // ASCII printable, no leading/trailing whitespace (the wire
        // format cannot carry it).
        "[!-~]([ -~]{0,28}[!-~])?",
        0..6,
    )
    .prop_map(|headers| {
        // Header lookup is case-insensitive, so drop names that collide
        // with each other or with the common block.
        let mut seen = HashSet::new();
        headers
            .into_iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                !matches!(lower.as_str(), "content-length" | "server" | "date")
                    && seen.insert(lower)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn render_then_parse_preserves_the_response(
        status in status_strategy(),
        headers in headers_strategy(),
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut response = HttpResponse::new(status).with_body(body.clone());
        for (name, value) in &headers {
            response = response.with_header(name.clone(), value.clone());
        }

        let pool = BufferPool::new(64 * 1024, Arc::new(ServerStats::default()));
        let mut buf = pool.acquire();
        let mut common = CommonHeaders::new("weft-test");
        let block = common.refreshed(UNIX_EPOCH + Duration::from_secs(784_111_777)).to_vec();
        prop_assert!(render_response(&mut buf, &block, &response));
        prop_assert_eq!(buf.len(), response.output_size() + block.len());

        let decoded = decode(buf.filled());
        prop_assert_eq!(decoded.status, status);
        prop_assert_eq!(&decoded.body, &body);
        let content_length = body.len().to_string();
        prop_assert_eq!(
            header_value(&decoded.headers, "Content-Length"),
            Some(content_length.as_str())
        );
        prop_assert_eq!(header_value(&decoded.headers, "Server"), Some("weft-test"));
        prop_assert_eq!(
            header_value(&decoded.headers, "Date"),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        for (name, value) in &headers {
            prop_assert_eq!(header_value(&decoded.headers, name), Some(value.as_str()));
        }
    }
}
