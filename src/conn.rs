//! Per-connection state.
//!
//! A [`Connection`] is owned by exactly one worker for its entire lifetime
//! and is only ever touched from that worker's thread; mutating entry
//! points assert this. Buffer slots hold a pooled buffer only while bytes
//! are in flight. The membership flags guarantee a connection sits in any
//! given service queue at most once at a time.
//!
//! Close is terminal and exactly-once: it cancels the selector
//! registration, releases every buffer, clears both per-connection queues,
//! and removes the connection from the worker's map.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use crate::buffer::{BufferPool, PooledBuf};
use crate::error::CloseReason;
use crate::http::exchange::HttpExchange;
use crate::http::response::HttpResponse;
use crate::reactor::{Interest, Token};
use crate::worker::{DeferredWork, WorkerCore};

/// Per-TCP-session state owned by exactly one worker.
pub struct Connection {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    worker: Weak<WorkerCore>,
    self_ref: Weak<Connection>,

    closed: Cell<bool>,
    /// Interest currently armed on the selector. Delivery is oneshot, so
    /// the armed set is taken on every event and re-armed as needed.
    armed: Cell<Interest>,

    read_buf: RefCell<Option<PooledBuf>>,
    write_buf: RefCell<Option<PooledBuf>>,
    handshake_buf: RefCell<Option<PooledBuf>>,

    pending_requests: RefCell<VecDeque<HttpExchange>>,
    ready_responses: RefCell<VecDeque<HttpResponse>>,
    response_capacity: usize,

    read_queued: Cell<bool>,
    write_queued: Cell<bool>,
    handler_queued: Cell<bool>,
    /// The handler service stalled on this connection's full response
    /// queue; the writer re-readies it after draining a slot.
    handler_parked: Cell<bool>,
    /// The client asked for close; no further requests are read and the
    /// writer closes once everything queued has been flushed.
    close_pending: Cell<bool>,
}

impl Connection {
    pub(crate) fn new(
        worker: &Rc<WorkerCore>,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        response_capacity: usize,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            token,
            stream,
            peer,
            worker: Rc::downgrade(worker),
            self_ref: self_ref.clone(),
            closed: Cell::new(false),
            armed: Cell::new(Interest::NONE),
            read_buf: RefCell::new(None),
            write_buf: RefCell::new(None),
            handshake_buf: RefCell::new(None),
            pending_requests: RefCell::new(VecDeque::new()),
            ready_responses: RefCell::new(VecDeque::new()),
            response_capacity,
            read_queued: Cell::new(false),
            write_queued: Cell::new(false),
            handler_queued: Cell::new(false),
            handler_parked: Cell::new(false),
            close_pending: Cell::new(false),
        })
    }

    /// The selector token of this connection.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// The peer's address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true once the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Queues a response for writing.
    ///
    /// Called by handlers, exactly once per exchange. The handler service
    /// checks queue capacity before invoking a handler, so the queue has
    /// room here by construction.
    pub fn append_response(&self, response: HttpResponse) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        worker.assert_owner();
        if self.is_closed() {
            return;
        }
        {
            let mut queue = self.ready_responses.borrow_mut();
            debug_assert!(
                queue.len() < self.response_capacity,
                "ready-response queue overflow"
            );
            queue.push_back(response);
        }
        self.offer_to_writer(&worker);
    }

    /// Offers this connection to the response writer service, respecting
    /// the at-most-once membership flag. A momentarily full service queue
    /// defers the offer to the worker loop; the signal is never dropped.
    pub(crate) fn offer_to_writer(&self, worker: &Rc<WorkerCore>) {
        if self.write_queued.get() || self.is_closed() {
            return;
        }
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        self.write_queued.set(true);
        if let Err(conn) = worker.writers().write.offer(me) {
            worker.defer(DeferredWork::OfferWrite(conn));
        }
    }

    /// Closes the connection. Idempotent; the first call wins.
    pub(crate) fn close(&self, reason: &CloseReason) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        worker.assert_owner();
        if self.closed.replace(true) {
            return;
        }
        tracing::debug!(
            worker = worker.id,
            token = self.token.0,
            peer = %self.peer,
            reason = %reason,
            "closing connection"
        );
        let _ = worker.selector.deregister(self.raw_fd());
        *self.read_buf.borrow_mut() = None;
        *self.write_buf.borrow_mut() = None;
        *self.handshake_buf.borrow_mut() = None;
        self.pending_requests.borrow_mut().clear();
        self.ready_responses.borrow_mut().clear();
        worker.conns.borrow_mut().remove(&self.token.0);
        worker.stats.connection_closed();
    }

    /// Adds `interest` to the armed set and re-arms the selector.
    ///
    /// A failure on an already-closed connection is swallowed; otherwise
    /// the descriptor is broken and the connection is closed.
    pub(crate) fn request_interest(&self, interest: Interest) {
        if self.is_closed() {
            return;
        }
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        let combined = self.armed.get().add(interest);
        match worker
            .selector
            .rearm(self.raw_fd(), self.token, combined)
        {
            Ok(()) => self.armed.set(combined),
            Err(e) => {
                tracing::debug!(token = self.token.0, error = %e, "interest rearm failed");
                self.close(&CloseReason::PeerClosed);
            }
        }
    }

    /// Takes the armed interest set on event delivery (oneshot consumed
    /// the registration).
    pub(crate) fn take_armed(&self) -> Interest {
        self.armed.replace(Interest::NONE)
    }

    pub(crate) fn set_armed(&self, interest: Interest) {
        self.armed.set(interest);
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    // --- buffer slots ---

    pub(crate) fn read_buf(&self) -> &RefCell<Option<PooledBuf>> {
        &self.read_buf
    }

    pub(crate) fn write_buf(&self) -> &RefCell<Option<PooledBuf>> {
        &self.write_buf
    }

    /// Acquires the read buffer from `pool` if the slot is empty.
    pub(crate) fn ensure_read_buf(&self, pool: &BufferPool) {
        let mut slot = self.read_buf.borrow_mut();
        if slot.is_none() {
            *slot = Some(pool.acquire());
        }
    }

    /// Acquires the write buffer from `pool` if the slot is empty.
    pub(crate) fn ensure_write_buf(&self, pool: &BufferPool) {
        let mut slot = self.write_buf.borrow_mut();
        if slot.is_none() {
            *slot = Some(pool.acquire());
        }
    }

    /// Releases the read buffer if it holds no in-flight bytes.
    pub(crate) fn release_read_buf_if_empty(&self) {
        let mut slot = self.read_buf.borrow_mut();
        if slot.as_ref().is_some_and(PooledBuf::is_empty) {
            *slot = None;
        }
    }

    /// Releases the write buffer if it holds no in-flight bytes.
    pub(crate) fn release_write_buf_if_empty(&self) {
        let mut slot = self.write_buf.borrow_mut();
        if slot.as_ref().is_some_and(PooledBuf::is_empty) {
            *slot = None;
        }
    }

    // --- request deque (reader -> handler) ---

    pub(crate) fn push_request(&self, exchange: HttpExchange) {
        self.pending_requests.borrow_mut().push_back(exchange);
    }

    pub(crate) fn pop_request(&self) -> Option<HttpExchange> {
        self.pending_requests.borrow_mut().pop_front()
    }

    pub(crate) fn has_pending_requests(&self) -> bool {
        !self.pending_requests.borrow().is_empty()
    }

    // --- ready responses (handler -> writer) ---

    pub(crate) fn responses_full(&self) -> bool {
        self.ready_responses.borrow().len() >= self.response_capacity
    }

    pub(crate) fn pop_response(&self) -> Option<HttpResponse> {
        self.ready_responses.borrow_mut().pop_front()
    }

    pub(crate) fn push_front_response(&self, response: HttpResponse) {
        self.ready_responses.borrow_mut().push_front(response);
    }

    pub(crate) fn has_ready_responses(&self) -> bool {
        !self.ready_responses.borrow().is_empty()
    }

    // --- membership flags ---

    pub(crate) fn read_queued(&self) -> &Cell<bool> {
        &self.read_queued
    }

    pub(crate) fn write_queued(&self) -> &Cell<bool> {
        &self.write_queued
    }

    pub(crate) fn handler_queued(&self) -> &Cell<bool> {
        &self.handler_queued
    }

    pub(crate) fn handler_parked(&self) -> &Cell<bool> {
        &self.handler_parked
    }

    pub(crate) fn close_pending(&self) -> &Cell<bool> {
        &self.close_pending
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("peer", &self.peer)
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}
