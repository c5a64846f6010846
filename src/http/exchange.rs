//! A parsed request bound to its connection.

use std::rc::Rc;

use crate::conn::Connection;
use crate::http::parser::ParsedRequest;
use crate::http::types::{Method, Version};

/// A parsed HTTP request plus a back-reference to its [`Connection`].
///
/// Created when the parser completes a request, consumed exactly once by a
/// handler. The handler must call
/// [`connection().append_response`](Connection::append_response) exactly
/// once.
pub struct HttpExchange {
    method: Method,
    uri: String,
    path_len: usize,
    version: Version,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    wants_close: bool,
    conn: Rc<Connection>,
}

impl HttpExchange {
    pub(crate) fn new(parsed: ParsedRequest, conn: Rc<Connection>) -> Self {
        let wants_close = wants_close(parsed.version, &parsed.headers);
        Self {
            path_len: path_len_of(&parsed.uri),
            method: parsed.method,
            uri: parsed.uri,
            version: parsed.version,
            headers: parsed.headers,
            body: parsed.body,
            wants_close,
            conn,
        }
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The full request URI, query included.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI path bytes, query excluded. Handler lookup matches on this.
    #[must_use]
    pub fn path_bytes(&self) -> &[u8] {
        &self.uri.as_bytes()[..self.path_len]
    }

    /// The request HTTP version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// All request headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Looks up a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when this request asks for the connection to close afterwards.
    #[must_use]
    pub fn wants_close(&self) -> bool {
        self.wants_close
    }

    /// The connection this request arrived on.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExchange")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn path_len_of(uri: &str) -> usize {
    uri.find('?').unwrap_or(uri.len())
}

/// Whether the connection should close after this request: an explicit
/// `Connection` header wins, otherwise HTTP/1.0 defaults to close and
/// HTTP/1.1 to keep-alive.
pub(crate) fn wants_close(version: Version, headers: &[(String, String)]) -> bool {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                return true;
            }
            if value.eq_ignore_ascii_case("keep-alive") {
                return false;
            }
        }
    }
    version == Version::Http10
}
