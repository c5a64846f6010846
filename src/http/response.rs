//! HTTP responses and the zero-copy rendering path.
//!
//! A response carries a status code, typed response-specific headers, and a
//! body slice. `Content-Length` is not stored: it is derived from the body
//! at render time, so it always reflects the body length by construction.
//!
//! [`render_response`] is all-or-nothing: it either writes the complete
//! response into the buffer or returns `false` without touching it, letting
//! the writer flush and retry.

use std::borrow::Cow;
use std::fmt;

use crate::buffer::PooledBuf;
use crate::http::types::reason_phrase;

/// A typed response-header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// A string value.
    Str(Cow<'static, str>),
    /// An integral value, rendered in decimal.
    Int(u64),
}

impl HeaderValue {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::Int(v) => decimal_len(*v),
        }
    }
}

impl From<&'static str> for HeaderValue {
    fn from(s: &'static str) -> Self {
        Self::Str(Cow::Borrowed(s))
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Str(Cow::Owned(s))
    }
}

impl From<u64> for HeaderValue {
    fn from(v: u64) -> Self {
        Self::Int(v)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

fn decimal_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 10 {
        v /= 10;
        len += 1;
    }
    len
}

/// Writes `v` in decimal into `buf`.
fn put_decimal(buf: &mut PooledBuf, v: u64) {
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    let mut v = v;
    loop {
        pos -= 1;
        digits[pos] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    buf.put_slice(&digits[pos..]);
}

/// Pre-encoded status line for the hot codes; formatted otherwise.
fn status_line(status: u16) -> Cow<'static, [u8]> {
    match status {
        200 => Cow::Borrowed(&b"HTTP/1.1 200 OK\r\n"[..]),
        204 => Cow::Borrowed(&b"HTTP/1.1 204 No Content\r\n"[..]),
        400 => Cow::Borrowed(&b"HTTP/1.1 400 Bad Request\r\n"[..]),
        404 => Cow::Borrowed(&b"HTTP/1.1 404 Not Found\r\n"[..]),
        500 => Cow::Borrowed(&b"HTTP/1.1 500 Internal Server Error\r\n"[..]),
        other => Cow::Owned(format!("HTTP/1.1 {other} {}\r\n", reason_phrase(other)).into_bytes()),
    }
}

const CONTENT_LENGTH_PREFIX: &[u8] = b"Content-Length: ";

/// An HTTP response queued on a connection.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    headers: Vec<(Cow<'static, str>, HeaderValue)>,
    body: Cow<'static, [u8]>,
}

impl HttpResponse {
    /// Creates an empty-bodied response with the given status.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Cow::Borrowed(&[]),
        }
    }

    /// `200 OK` with the given body.
    #[must_use]
    pub fn ok(body: impl Into<Cow<'static, [u8]>>) -> Self {
        Self::new(200).with_body(body)
    }

    /// `200 OK` with a body and a `Content-Type`.
    #[must_use]
    pub fn ok_with_content_type(
        body: impl Into<Cow<'static, [u8]>>,
        content_type: impl Into<HeaderValue>,
    ) -> Self {
        Self::new(200)
            .with_body(body)
            .with_header("Content-Type", content_type)
    }

    /// `204 No Content`.
    #[must_use]
    pub fn no_content() -> Self {
        Self::new(204)
    }

    /// `404 Not Found` with an empty body.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(404)
    }

    /// `404 Not Found` with a body and a `Content-Type`.
    #[must_use]
    pub fn not_found_with_body(
        body: impl Into<Cow<'static, [u8]>>,
        content_type: impl Into<HeaderValue>,
    ) -> Self {
        Self::new(404)
            .with_body(body)
            .with_header("Content-Type", content_type)
    }

    /// Replaces the body. `Content-Length` tracks it automatically.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Cow<'static, [u8]>>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a response-specific header.
    ///
    /// `Content-Length` is managed by the renderer and must not be set
    /// here.
    #[must_use]
    pub fn with_header(
        mut self,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<HeaderValue>,
    ) -> Self {
        let name = name.into();
        debug_assert!(
            !name.eq_ignore_ascii_case("content-length"),
            "Content-Length is derived from the body"
        );
        self.headers.push((name, value.into()));
        self
    }

    /// The status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The response-specific headers.
    #[must_use]
    pub fn headers(&self) -> &[(Cow<'static, str>, HeaderValue)] {
        &self.headers
    }

    /// The body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Exact rendered size excluding the worker's common-header block.
    #[must_use]
    pub fn output_size(&self) -> usize {
        let mut size = status_line(self.status).len();
        for (name, value) in &self.headers {
            size += name.len() + 2 + value.encoded_len() + 2;
        }
        size += CONTENT_LENGTH_PREFIX.len() + decimal_len(self.body.len() as u64) + 2;
        size += 2; // terminating CRLF
        size += self.body.len();
        size
    }
}

/// Renders `response` into `buf` behind the worker's `common` header block.
///
/// Layout: status line, common headers, response-specific headers,
/// `Content-Length`, a bare CRLF, then the body. Returns `false` without
/// mutating the buffer when `buf.remaining()` cannot hold the whole
/// rendering; the caller flushes and retries.
pub fn render_response(buf: &mut PooledBuf, common: &[u8], response: &HttpResponse) -> bool {
    if buf.remaining() < response.output_size() + common.len() {
        return false;
    }

    buf.put_slice(&status_line(response.status));
    buf.put_slice(common);
    for (name, value) in &response.headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        match value {
            HeaderValue::Str(s) => buf.put_slice(s.as_bytes()),
            HeaderValue::Int(v) => put_decimal(buf, *v),
        }
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(CONTENT_LENGTH_PREFIX);
    put_decimal(buf, response.body.len() as u64);
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(&response.body);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::stats::ServerStats;
    use std::sync::Arc;

    fn make_buf(capacity: usize) -> PooledBuf {
        BufferPool::new(capacity, Arc::new(ServerStats::default())).acquire()
    }

    #[test]
    fn ok_response_layout() {
        let mut buf = make_buf(1024);
        let resp = HttpResponse::ok_with_content_type(b"hi".as_slice(), "text/plain");
        let common = b"Server: weft\r\nDate: Thu, 01 Jan 1970 00:00:00 GMT\r\n";
        assert!(render_response(&mut buf, common, &resp));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nServer: weft\r\nDate: "));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn output_size_is_exact() {
        let common = b"Server: weft\r\n";
        for resp in [
            HttpResponse::ok(b"hello world".as_slice()),
            HttpResponse::no_content(),
            HttpResponse::not_found(),
            HttpResponse::not_found_with_body(b"gone".as_slice(), "text/plain"),
            HttpResponse::new(503).with_header("Retry-After", 7u64),
        ] {
            let mut buf = make_buf(4096);
            assert!(render_response(&mut buf, common, &resp));
            assert_eq!(buf.len(), resp.output_size() + common.len());
        }
    }

    #[test]
    fn content_length_always_reflects_body() {
        let resp = HttpResponse::ok(b"abc".as_slice());
        let mut buf = make_buf(1024);
        assert!(render_response(&mut buf, b"", &resp));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));

        let resp = resp.with_body(b"abcdef".as_slice());
        let mut buf = make_buf(1024);
        assert!(render_response(&mut buf, b"", &resp));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 6\r\n"));
    }

    #[test]
    fn no_content_shares_zero_length_shape() {
        let mut buf = make_buf(1024);
        assert!(render_response(&mut buf, b"", &HttpResponse::no_content()));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert_eq!(text, "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn render_rejects_without_mutation_when_too_small() {
        let mut buf = make_buf(64);
        buf.put_slice(b"existing");
        let resp = HttpResponse::ok(vec![b'x'; 100]);
        assert!(!render_response(&mut buf, b"", &resp));
        assert_eq!(buf.filled(), b"existing");
    }

    #[test]
    fn uncommon_status_line_is_formatted() {
        let mut buf = make_buf(1024);
        assert!(render_response(&mut buf, b"", &HttpResponse::new(418)));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 418 Unknown\r\n"));
    }

    #[test]
    fn int_header_values_render_in_decimal() {
        let mut buf = make_buf(1024);
        let resp = HttpResponse::new(503).with_header("Retry-After", 120u64);
        assert!(render_response(&mut buf, b"", &resp));
        let text = String::from_utf8(buf.filled().to_vec()).unwrap();
        assert!(text.contains("Retry-After: 120\r\n"));
    }

    #[test]
    fn decimal_len_matches_rendering() {
        for v in [0u64, 9, 10, 99, 100, 12_345, u64::MAX] {
            assert_eq!(decimal_len(v), v.to_string().len());
        }
    }
}
