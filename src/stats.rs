//! Shared server counters and gauges.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide counters maintained by the workers.
///
/// Gauges are updated on the owning worker threads and read from anywhere;
/// relaxed ordering is sufficient because nothing synchronizes through them.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_connections: AtomicUsize,
    buffers_in_use: AtomicUsize,
    connections_accepted: AtomicU64,
    requests_served: AtomicU64,
}

impl ServerStats {
    /// Number of accepted, not-yet-closed connections across all workers.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Number of pool buffers currently held by connections.
    #[must_use]
    pub fn buffers_in_use(&self) -> usize {
        self.buffers_in_use.load(Ordering::Relaxed)
    }

    /// Total connections accepted since startup.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Total requests dispatched to handlers since startup.
    #[must_use]
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_acquired(&self) {
        self.buffers_in_use.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn buffer_released(&self) {
        self.buffers_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }
}
