//! The cooperative service abstraction.
//!
//! A service is a named task with a bounded input queue. The worker runs
//! one ready service at a time; a service runs until its input queue is
//! empty or a downstream queue refuses an item, and never pre-empts.

use crate::queue::ServiceId;

/// Service slot of `ConnectionAcceptService`.
pub(crate) const ACCEPT_SERVICE: ServiceId = 0;
/// Service slot of `ConnectionReadService`.
pub(crate) const READ_SERVICE: ServiceId = 1;
/// Service slot of `RequestHandlerService`.
pub(crate) const HANDLE_SERVICE: ServiceId = 2;
/// Service slot of `ResponseWriterService`.
pub(crate) const WRITE_SERVICE: ServiceId = 3;
/// Number of services in a worker. Fixed before the worker starts; there
/// is no dynamic spawning.
pub(crate) const SERVICE_COUNT: usize = 4;

/// A cooperative task scheduled by the worker.
pub(crate) trait Service {
    /// Service name, for logs.
    fn name(&self) -> &'static str;

    /// Runs until suspension: the input queue is drained, or a full
    /// downstream queue refused an item. A service that suspends on a
    /// full queue keeps the undelivered item and is re-readied by the
    /// consumer once a slot frees up; delivery resumes before new input
    /// is taken. The wake-up travels through the queue itself, so the
    /// scheduler sees nothing to act on here.
    fn run(&mut self);
}
