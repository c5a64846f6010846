//! Server configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `address` | `127.0.0.1:0` |
//! | `worker_count` | available CPU parallelism |
//! | `reuse_port` | `false` |
//! | `listen_backlog` | 1024 |
//! | `connection_buffer_size` | 64 KiB |
//! | `handshake_buffer_size` | 8 KiB |
//! | `ready_response_queue_capacity` | 64 |
//! | `service_queue_capacity` | 4096 |
//! | `accept_inbox_capacity` | 1024 |
//! | `poll_timeout` | 100 ms |

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host and port to bind.
    pub address: SocketAddr,
    /// Number of workers (>= 1).
    pub worker_count: usize,
    /// If true each worker owns its own `SO_REUSEPORT` listen socket and the
    /// kernel distributes accepts; otherwise a dedicated acceptor thread
    /// hands sockets to workers in rotation.
    pub reuse_port: bool,
    /// Kernel accept-queue depth.
    pub listen_backlog: i32,
    /// Capacity of each pooled connection buffer (read and write).
    pub connection_buffer_size: usize,
    /// Capacity of each pooled handshake buffer.
    pub handshake_buffer_size: usize,
    /// Per-connection pending-response capacity.
    pub ready_response_queue_capacity: usize,
    /// Input-queue depth of each pipeline service inside a worker.
    pub service_queue_capacity: usize,
    /// Depth of the acceptor-to-worker handoff queue.
    pub accept_inbox_capacity: usize,
    /// How long the selector blocks when no service is ready.
    pub poll_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            worker_count: std::thread::available_parallelism().map_or(1, usize::from),
            reuse_port: false,
            listen_backlog: 1024,
            connection_buffer_size: 64 * 1024,
            handshake_buffer_size: 8 * 1024,
            ready_response_queue_capacity: 64,
            service_queue_capacity: 4096,
            accept_inbox_capacity: 1024,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    /// Set the bind address.
    #[must_use]
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Set the number of workers.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Enable or disable per-worker `SO_REUSEPORT` listen sockets.
    #[must_use]
    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Set the kernel accept-queue depth.
    #[must_use]
    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set the pooled connection buffer capacity.
    #[must_use]
    pub fn connection_buffer_size(mut self, size: usize) -> Self {
        self.connection_buffer_size = size;
        self
    }

    /// Set the pooled handshake buffer capacity.
    #[must_use]
    pub fn handshake_buffer_size(mut self, size: usize) -> Self {
        self.handshake_buffer_size = size;
        self
    }

    /// Set the per-connection pending-response capacity.
    #[must_use]
    pub fn ready_response_queue_capacity(mut self, capacity: usize) -> Self {
        self.ready_response_queue_capacity = capacity;
        self
    }

    /// Set the input-queue depth of each pipeline service.
    #[must_use]
    pub fn service_queue_capacity(mut self, capacity: usize) -> Self {
        self.service_queue_capacity = capacity;
        self
    }

    /// Set the acceptor-to-worker handoff queue depth.
    #[must_use]
    pub fn accept_inbox_capacity(mut self, capacity: usize) -> Self {
        self.accept_inbox_capacity = capacity;
        self
    }

    /// Set the idle selector timeout.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be >= 1"));
        }
        if self.listen_backlog <= 0 {
            return Err(Error::config("listen_backlog must be positive"));
        }
        // A buffer must hold at least one maximal request line plus slack.
        if self.connection_buffer_size < 256 {
            return Err(Error::config("connection_buffer_size must be >= 256"));
        }
        if self.handshake_buffer_size == 0 {
            return Err(Error::config("handshake_buffer_size must be non-zero"));
        }
        if self.ready_response_queue_capacity == 0 {
            return Err(Error::config(
                "ready_response_queue_capacity must be non-zero",
            ));
        }
        if self.service_queue_capacity == 0 {
            return Err(Error::config("service_queue_capacity must be non-zero"));
        }
        if self.accept_inbox_capacity == 0 {
            return Err(Error::config("accept_inbox_capacity must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = ServerConfig::default()
            .worker_count(4)
            .reuse_port(true)
            .listen_backlog(128)
            .connection_buffer_size(16 * 1024)
            .ready_response_queue_capacity(8)
            .poll_timeout(Duration::from_millis(10));
        assert_eq!(config.worker_count, 4);
        assert!(config.reuse_port);
        assert_eq!(config.listen_backlog, 128);
        assert_eq!(config.connection_buffer_size, 16 * 1024);
        assert_eq!(config.ready_response_queue_capacity, 8);
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = ServerConfig::default().worker_count(0).validate();
        assert!(err.is_err());
    }

    #[test]
    fn tiny_connection_buffer_rejected() {
        let err = ServerConfig::default()
            .connection_buffer_size(64)
            .validate();
        assert!(err.is_err());
    }
}
