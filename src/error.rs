//! Error types and the connection close-reason taxonomy.
//!
//! Recoverable conditions (peer close, partial writes, full queues) are
//! handled inside the owning worker and never escape it. Invariant
//! violations are scheduler bugs and are fatal to the worker.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::http::parser::ParseError;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer closed the connection.
    PeerClosed,
    /// A socket write failed on a closed channel.
    WriteFailed,
    /// Malformed request bytes.
    Parse,
    /// A bounded queue could not accept an item.
    BufferPressure,
    /// A mutating API was called off-thread or the selector reported an
    /// operation the scheduler never asked for.
    SchedulerInvariant,
    /// A user handler raised.
    Handler,
    /// The server is shutting down.
    ShuttingDown,
    /// Invalid configuration.
    Config,
    /// An underlying I/O error.
    Io,
}

/// The main error type for server operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a configuration error with the given message.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_context(msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::new(ErrorKind::Parse).with_source(e)
    }
}

/// A specialized `Result` for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection was closed.
///
/// Rendered into the per-connection debug log on close; never sent to the
/// peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end of the connection.
    PeerClosed,
    /// A write hit a closed channel.
    WriteFailed,
    /// The request bytes could not be parsed.
    Parse(ParseError),
    /// A rendered response cannot fit an empty write buffer.
    ResponseTooLarge {
        /// Rendered size of the offending response, common headers included.
        size: usize,
        /// Capacity of the connection's write buffer.
        capacity: usize,
    },
    /// A user handler panicked while serving this connection.
    HandlerPanicked,
    /// The client asked for the connection to be closed.
    RequestedByPeer,
    /// The server is shutting down.
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::WriteFailed => write!(f, "write failed on closed channel"),
            Self::Parse(e) => write!(f, "request parse error: {e}"),
            Self::ResponseTooLarge { size, capacity } => write!(
                f,
                "response of {size} bytes exceeds write buffer capacity {capacity}"
            ),
            Self::HandlerPanicked => write!(f, "handler panicked"),
            Self::RequestedByPeer => write!(f, "client requested close"),
            Self::ServerShutdown => write!(f, "Server is shutting down."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::SchedulerInvariant);
        assert_eq!(err.to_string(), "SchedulerInvariant");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::Config).with_context("worker_count must be >= 1");
        assert_eq!(err.to_string(), "Config: worker_count must be >= 1");
    }

    #[test]
    fn io_source_is_exposed() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());
    }

    #[test]
    fn shutdown_reason_text_is_stable() {
        assert_eq!(
            CloseReason::ServerShutdown.to_string(),
            "Server is shutting down."
        );
    }

    #[test]
    fn response_too_large_reason_names_both_sizes() {
        let reason = CloseReason::ResponseTooLarge {
            size: 9000,
            capacity: 4096,
        };
        let text = reason.to_string();
        assert!(text.contains("9000"));
        assert!(text.contains("4096"));
    }
}
