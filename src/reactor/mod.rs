//! I/O readiness selection.
//!
//! [`Selector`] wraps [`polling::Poller`] and is the single source of
//! readiness information inside a worker. Registration, re-arming, and
//! removal all take the raw descriptor, so no token-to-descriptor side
//! table is needed.
//!
//! Delivery is oneshot: once an event for a descriptor fires, its interest
//! is consumed and must be re-armed explicitly with [`Selector::rearm`].
//! This is what keeps a readable connection from waking the worker in a
//! busy loop while it already sits in a service queue.
//!
//! # Descriptor validity
//!
//! The poller cannot verify at compile time that a registered file
//! descriptor remains valid for the duration of its registration, so the
//! registration, re-arm, and removal calls are confined to `unsafe`
//! wrappers in this module — the only unsafe code in the crate. Callers
//! uphold the invariant structurally: a connection owns its socket and
//! deregisters in `close` before the socket drops, and a worker's listener
//! outlives its registration.

#![allow(unsafe_code)]

use polling::{Event as PollEvent, Poller};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token identifying a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Creates a new token.
    #[must_use]
    pub const fn new(val: usize) -> Self {
        Self(val)
    }
}

/// Interest flags indicating what I/O events to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no interest is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token of the registered descriptor.
    pub token: Token,
    /// Readiness flags that triggered.
    pub ready: Interest,
}

/// Container for events returned by [`Selector::poll`].
///
/// Re-used across poll calls to avoid allocation.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    scratch: Vec<PollEvent>,
    capacity: usize,
}

impl Events {
    /// Creates a new events buffer with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            scratch: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no events are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the event at `idx`, if any.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx).copied()
    }

    /// Iterates over events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }

    fn clear(&mut self) {
        self.inner.clear();
        self.scratch.clear();
    }
}

fn interest_to_poll_event(token: Token, interest: Interest) -> PollEvent {
    let key = token.0;
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

fn poll_event_to_interest(event: &PollEvent) -> Interest {
    let mut interest = Interest::NONE;
    if event.readable {
        interest = interest.add(Interest::READABLE);
    }
    if event.writable {
        interest = interest.add(Interest::WRITABLE);
    }
    interest
}

/// Readiness selector owned by a worker.
pub struct Selector {
    poller: Arc<Poller>,
}

impl Selector {
    /// Creates a new selector.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
        })
    }

    /// Returns a handle other threads can use to interrupt a blocking poll.
    #[must_use]
    pub fn waker(&self) -> SelectorWaker {
        SelectorWaker {
            poller: Arc::clone(&self.poller),
        }
    }

    /// Registers a descriptor with the given initial interest.
    ///
    /// The descriptor must stay open until the matching
    /// [`deregister`](Self::deregister); see the module docs.
    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // SAFETY: callers keep `fd` open until `deregister` (module docs).
        unsafe { self.poller_add(fd, interest_to_poll_event(token, interest)) }
    }

    /// Re-arms a registered descriptor with a new interest set.
    ///
    /// Required after every delivered event; delivery is oneshot.
    pub fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // SAFETY: callers keep `fd` open until `deregister` (module docs).
        unsafe { self.poller_modify(fd, interest_to_poll_event(token, interest)) }
    }

    /// Removes a descriptor from the selector.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: callers deregister before closing `fd` (module docs).
        unsafe { self.poller_delete(fd) }
    }

    /// Hands `fd` to the poller.
    ///
    /// # Safety
    ///
    /// `fd` must remain open from this call until the matching
    /// [`poller_delete`](Self::poller_delete); the poller cannot verify
    /// descriptor validity at compile time.
    unsafe fn poller_add(&self, fd: RawFd, event: PollEvent) -> io::Result<()> {
        self.poller.add(fd, event)
    }

    /// Changes the interest of a registered `fd`.
    ///
    /// # Safety
    ///
    /// Same descriptor-validity contract as [`poller_add`](Self::poller_add).
    unsafe fn poller_modify(&self, fd: RawFd, event: PollEvent) -> io::Result<()> {
        self.poller.modify(fd, event)
    }

    /// Removes `fd` from the poller.
    ///
    /// # Safety
    ///
    /// `fd` must still be open; removal of a closed descriptor is
    /// undefined from the poller's point of view.
    unsafe fn poller_delete(&self, fd: RawFd) -> io::Result<()> {
        self.poller.delete(fd)
    }

    /// Polls for events, blocking up to `timeout`.
    ///
    /// `Some(Duration::ZERO)` polls without blocking; `None` blocks until
    /// an event or a [`SelectorWaker::wake`].
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        self.poller.wait(&mut events.scratch, timeout)?;
        for poll_event in &events.scratch {
            if events.inner.len() == events.capacity {
                break;
            }
            events.inner.push(Event {
                token: Token(poll_event.key),
                ready: poll_event_to_interest(poll_event),
            });
        }
        Ok(events.inner.len())
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").finish_non_exhaustive()
    }
}

/// Cross-thread handle that interrupts a blocking [`Selector::poll`].
#[derive(Clone)]
pub struct SelectorWaker {
    poller: Arc<Poller>,
}

impl SelectorWaker {
    /// Wakes the selector. Coalesced by the backend; safe from any thread.
    pub fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }
}

impl std::fmt::Debug for SelectorWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorWaker").finish_non_exhaustive()
    }
}
