//! Incremental HTTP/1.1 request parser.
//!
//! [`parse_request`] scans the in-flight bytes of a connection's read
//! buffer. Incomplete input is not an error: the parser returns `None` and
//! the caller waits for more bytes. A returned request reports how many
//! bytes it consumed so pipelined requests can be peeled off one by one.
//!
//! The head (request line + headers) and the body must each fit the read
//! buffer; requests that can never complete within the buffer are rejected
//! rather than stalled forever.

use crate::http::types::{Method, Version};
use std::fmt;

/// Maximum allowed request-line length.
pub const MAX_REQUEST_LINE: usize = 8192;

/// Maximum number of headers per request.
pub const MAX_HEADERS: usize = 128;

/// HTTP/1.1 request parse errors. Any of these terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is malformed.
    BadRequestLine,
    /// Unrecognised HTTP method.
    BadMethod,
    /// Unsupported HTTP version in request.
    UnsupportedVersion,
    /// A header line is malformed.
    BadHeader,
    /// Header name contains invalid characters.
    InvalidHeaderName,
    /// Content-Length header is not a valid integer.
    BadContentLength,
    /// Multiple Content-Length headers present.
    DuplicateContentLength,
    /// Both Content-Length and Transfer-Encoding present (RFC 7230 3.3.3
    /// violation; a request smuggling vector).
    AmbiguousBodyLength,
    /// Transfer-Encoding is present; chunked request bodies are not
    /// accepted.
    UnsupportedTransferEncoding,
    /// Too many headers.
    TooManyHeaders,
    /// Request line too long.
    RequestLineTooLong,
    /// The head does not fit the read buffer.
    HeadTooLarge {
        /// Read buffer capacity.
        limit: usize,
    },
    /// The declared body does not fit the read buffer.
    BodyTooLarge {
        /// Read buffer capacity.
        limit: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::BadMethod => write!(f, "unrecognised HTTP method"),
            Self::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            Self::BadHeader => write!(f, "malformed header"),
            Self::InvalidHeaderName => write!(f, "invalid header name"),
            Self::BadContentLength => write!(f, "invalid Content-Length"),
            Self::DuplicateContentLength => write!(f, "duplicate Content-Length"),
            Self::AmbiguousBodyLength => {
                write!(f, "both Content-Length and Transfer-Encoding present")
            }
            Self::UnsupportedTransferEncoding => write!(f, "unsupported Transfer-Encoding"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::RequestLineTooLong => write!(f, "request line too long"),
            Self::HeadTooLarge { limit } => {
                write!(f, "header block exceeds read buffer ({limit} bytes)")
            }
            Self::BodyTooLarge { limit } => {
                write!(f, "body exceeds read buffer ({limit} bytes)")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// A fully parsed request peeled off the front of the read buffer.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// HTTP method.
    pub method: Method,
    /// Request URI (e.g. `/path?query`).
    pub uri: String,
    /// HTTP version.
    pub version: Version,
    /// Headers as name-value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
    /// Total bytes consumed from the buffer, body included.
    pub consumed: usize,
}

/// Find the position of `\r\n\r\n` in `buf`, returning the index of the
/// first byte after the delimiter.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the request line: `METHOD SP URI SP VERSION`.
fn parse_request_line(line: &str) -> Result<(Method, String, Version), ParseError> {
    let mut parts = line.split_ascii_whitespace();
    let method_str = parts.next().ok_or(ParseError::BadRequestLine)?;
    let uri = parts.next().ok_or(ParseError::BadRequestLine)?;
    let version_str = parts.next().ok_or(ParseError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::BadRequestLine);
    }

    let method = Method::from_bytes(method_str.as_bytes()).ok_or(ParseError::BadMethod)?;
    let version =
        Version::from_bytes(version_str.as_bytes()).ok_or(ParseError::UnsupportedVersion)?;

    Ok((method, uri.to_owned(), version))
}

/// Validates an HTTP field-name (RFC 7230 token / tchar set).
fn is_valid_header_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.as_bytes().iter().all(|&b| {
        matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
        )
    })
}

/// Parse a single `Name: Value` header line.
fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let colon = line.find(':').ok_or(ParseError::BadHeader)?;
    let raw_name = &line[..colon];
    let name = raw_name.trim();
    let value = line[colon + 1..].trim().to_owned();
    if raw_name != name {
        return Err(ParseError::InvalidHeaderName);
    }
    if !is_valid_header_name(name) {
        return Err(ParseError::InvalidHeaderName);
    }
    Ok((name.to_owned(), value))
}

/// Look up a header value, rejecting duplicates.
fn unique_header_value<'a>(
    headers: &'a [(String, String)],
    name: &str,
) -> Result<Option<&'a str>, ParseError> {
    let mut found = None;
    for (n, v) in headers {
        if n.eq_ignore_ascii_case(name) {
            if found.is_some() {
                if name.eq_ignore_ascii_case("content-length") {
                    return Err(ParseError::DuplicateContentLength);
                }
                return Err(ParseError::BadHeader);
            }
            found = Some(v.as_str());
        }
    }
    Ok(found)
}

/// Determine the body length from the headers.
///
/// Per RFC 7230 Section 3.3.3, having both Transfer-Encoding and
/// Content-Length could indicate a request smuggling attempt.
fn body_length(headers: &[(String, String)]) -> Result<usize, ParseError> {
    let te = headers
        .iter()
        .any(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"));
    let cl = unique_header_value(headers, "Content-Length")?;

    if te && cl.is_some() {
        return Err(ParseError::AmbiguousBodyLength);
    }
    if te {
        return Err(ParseError::UnsupportedTransferEncoding);
    }
    match cl {
        Some(v) => v.trim().parse().map_err(|_| ParseError::BadContentLength),
        None => Ok(0),
    }
}

/// Attempt to parse one complete request from the front of `buf`.
///
/// `buf_capacity` is the capacity of the backing read buffer; it bounds
/// both the head and the body, since a request larger than the buffer can
/// never become complete.
pub fn parse_request(
    buf: &[u8],
    buf_capacity: usize,
) -> Result<Option<ParsedRequest>, ParseError> {
    let Some(head_len) = find_head_end(buf) else {
        // No terminator yet. Reject early when it can never arrive.
        if buf.len() >= buf_capacity {
            return Err(ParseError::HeadTooLarge {
                limit: buf_capacity,
            });
        }
        if !buf.contains(&b'\n') && buf.len() > MAX_REQUEST_LINE {
            return Err(ParseError::RequestLineTooLong);
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_len - 4]).map_err(|_| ParseError::BadHeader)?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;
    if request_line.len() > MAX_REQUEST_LINE {
        return Err(ParseError::RequestLineTooLong);
    }
    let (method, uri, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if headers.len() == MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }
        headers.push(parse_header_line(line)?);
    }

    let body_len = body_length(&headers)?;
    if head_len + body_len > buf_capacity {
        return Err(ParseError::BodyTooLarge {
            limit: buf_capacity,
        });
    }
    if buf.len() < head_len + body_len {
        return Ok(None);
    }

    Ok(Some(ParsedRequest {
        method,
        uri,
        version,
        headers,
        body: buf[head_len..head_len + body_len].to_vec(),
        consumed: head_len + body_len,
    }))
}
