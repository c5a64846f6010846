//! The four HTTP pipeline services, in data-flow order: accept → read →
//! handle → write.
//!
//! Per-connection causality is preserved by construction: a connection is
//! enqueued into the next stage only by the stage that finished with it,
//! and the membership flags keep it from sitting in any stage's queue
//! twice.

use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

use crate::buffer::PooledBuf;
use crate::conn::Connection;
use crate::error::CloseReason;
use crate::handler::generic_not_found;
use crate::http::exchange::HttpExchange;
use crate::http::parser::parse_request;
use crate::http::response::render_response;
use crate::queue::QueueReader;
use crate::reactor::Interest;
use crate::worker::service::{Service, HANDLE_SERVICE, READ_SERVICE};
use crate::worker::{AcceptedSocket, WorkerCore};

/// Outcome of processing one connection within a service.
enum Step {
    Done,
    Parked,
}

/// Drains newly accepted sockets, wraps each in a [`Connection`], and
/// registers it with the selector.
pub(crate) struct AcceptService {
    core: Rc<WorkerCore>,
    input: QueueReader<AcceptedSocket>,
}

impl AcceptService {
    pub(crate) fn new(core: Rc<WorkerCore>, input: QueueReader<AcceptedSocket>) -> Self {
        Self { core, input }
    }

    fn setup(&self, sock: AcceptedSocket) -> io::Result<()> {
        sock.stream.set_nonblocking(true)?;
        sock.stream.set_nodelay(true)?;
        let token = self.core.alloc_token();
        let conn = Connection::new(
            &self.core,
            token,
            sock.stream,
            sock.peer,
            self.core.config.ready_response_queue_capacity,
        );
        self.core
            .selector
            .register(conn.raw_fd(), token, Interest::NONE)?;
        self.core.conns.borrow_mut().insert(token.0, Rc::clone(&conn));
        self.core.stats.connection_opened();
        conn.request_interest(Interest::READABLE);
        tracing::debug!(
            worker = self.core.id,
            token = token.0,
            peer = %conn.peer_addr(),
            "connection accepted"
        );
        Ok(())
    }
}

impl Service for AcceptService {
    fn name(&self) -> &'static str {
        "ConnectionAcceptService"
    }

    fn run(&mut self) {
        while let Some(sock) = self.input.pop() {
            if let Err(e) = self.setup(sock) {
                tracing::debug!(
                    worker = self.core.id,
                    error = %e,
                    "failed to set up accepted connection"
                );
            }
        }
    }
}

/// Reads readable connections, feeds bytes to the parser, and hands
/// connections with complete requests to the handler service.
pub(crate) struct ReadService {
    core: Rc<WorkerCore>,
    input: QueueReader<Rc<Connection>>,
    /// Connection whose handoff to the handler service is pending after a
    /// park; retried first on resume.
    carry: Option<Rc<Connection>>,
}

impl ReadService {
    pub(crate) fn new(core: Rc<WorkerCore>, input: QueueReader<Rc<Connection>>) -> Self {
        Self {
            core,
            input,
            carry: None,
        }
    }

    /// Parses as many complete requests as the buffer holds. Returns false
    /// when the connection was closed.
    fn parse_requests(&self, conn: &Rc<Connection>) -> bool {
        loop {
            let parsed = {
                let mut slot = conn.read_buf().borrow_mut();
                let buf = slot.as_mut().expect("read buffer present while parsing");
                match parse_request(buf.filled(), buf.capacity()) {
                    Ok(Some(req)) => {
                        buf.consume(req.consumed);
                        Ok(Some(req))
                    }
                    other => other,
                }
            };
            match parsed {
                Ok(Some(req)) => {
                    let exchange = HttpExchange::new(req, Rc::clone(conn));
                    if exchange.wants_close() {
                        conn.close_pending().set(true);
                    }
                    conn.push_request(exchange);
                    if conn.close_pending().get() {
                        return true;
                    }
                }
                Ok(None) => {
                    let mut slot = conn.read_buf().borrow_mut();
                    if let Some(buf) = slot.as_mut() {
                        buf.compact();
                    }
                    return true;
                }
                Err(e) => {
                    tracing::debug!(
                        worker = self.core.id,
                        token = conn.token().0,
                        error = %e,
                        "request parse error"
                    );
                    conn.close(&CloseReason::Parse(e));
                    return false;
                }
            }
        }
    }

    fn process(&self, conn: &Rc<Connection>) -> Step {
        if conn.is_closed() {
            conn.read_queued().set(false);
            return Step::Done;
        }
        conn.ensure_read_buf(&self.core.conn_buffers);

        let mut rearm = false;
        loop {
            if conn.close_pending().get() {
                break;
            }
            let read_result: io::Result<usize> = {
                let mut slot = conn.read_buf().borrow_mut();
                let buf = slot.as_mut().expect("read buffer acquired above");
                debug_assert!(buf.remaining() > 0, "read buffer full without parse error");
                let mut stream = conn.stream();
                match stream.read(buf.unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            };
            match read_result {
                Ok(0) => {
                    conn.close(&CloseReason::PeerClosed);
                    return Step::Done;
                }
                Ok(_) => {
                    if !self.parse_requests(conn) {
                        return Step::Done;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    rearm = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(
                        worker = self.core.id,
                        token = conn.token().0,
                        error = %e,
                        "read failed"
                    );
                    conn.close(&CloseReason::PeerClosed);
                    return Step::Done;
                }
            }
        }

        if !conn.handler_queued().get() && conn.has_pending_requests() {
            conn.handler_queued().set(true);
            if let Err(c) = self
                .core
                .writers()
                .handle
                .offer_or_park(Rc::clone(conn), READ_SERVICE)
            {
                c.handler_queued().set(false);
                return Step::Parked;
            }
        }

        if conn.close_pending().get() {
            // Bytes after a close-requesting request are never served.
            *conn.read_buf().borrow_mut() = None;
            conn.read_queued().set(false);
            return Step::Done;
        }
        if rearm {
            conn.release_read_buf_if_empty();
            conn.read_queued().set(false);
            conn.request_interest(Interest::READABLE);
        }
        Step::Done
    }
}

impl Service for ReadService {
    fn name(&self) -> &'static str {
        "ConnectionReadService"
    }

    fn run(&mut self) {
        if let Some(conn) = self.carry.take() {
            if let Step::Parked = self.process(&conn) {
                self.carry = Some(conn);
                return;
            }
        }
        while let Some(conn) = self.input.pop() {
            if let Step::Parked = self.process(&conn) {
                self.carry = Some(conn);
                return;
            }
        }
    }
}

/// Drains each connection's queued requests through its URL-bound handler.
pub(crate) struct HandleService {
    core: Rc<WorkerCore>,
    input: QueueReader<Rc<Connection>>,
    /// Connection whose response queue filled up mid-drain; resumed when
    /// the writer frees a slot.
    carry: Option<Rc<Connection>>,
}

impl HandleService {
    pub(crate) fn new(core: Rc<WorkerCore>, input: QueueReader<Rc<Connection>>) -> Self {
        Self {
            core,
            input,
            carry: None,
        }
    }

    fn process(&self, conn: &Rc<Connection>) -> Step {
        if conn.is_closed() {
            return Step::Done;
        }
        loop {
            if !conn.has_pending_requests() {
                return Step::Done;
            }
            if conn.responses_full() {
                conn.handler_parked().set(true);
                return Step::Parked;
            }
            let Some(exchange) = conn.pop_request() else {
                return Step::Done;
            };
            let handler = {
                let registry = self.core.registry.borrow();
                registry.lookup(exchange.path_bytes()).cloned()
            }
            .unwrap_or_else(|| Arc::clone(generic_not_found()));

            self.core.stats.request_served();
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(exchange)));
            if outcome.is_err() {
                tracing::error!(
                    worker = self.core.id,
                    token = conn.token().0,
                    "handler panicked; closing connection"
                );
                conn.close(&CloseReason::HandlerPanicked);
                return Step::Done;
            }
            if conn.is_closed() {
                return Step::Done;
            }
        }
    }
}

impl Service for HandleService {
    fn name(&self) -> &'static str {
        "RequestHandlerService"
    }

    fn run(&mut self) {
        if let Some(conn) = self.carry.take() {
            if let Step::Parked = self.process(&conn) {
                self.carry = Some(conn);
                return;
            }
        }
        while let Some(conn) = self.input.pop() {
            conn.handler_queued().set(false);
            if let Step::Parked = self.process(&conn) {
                self.carry = Some(conn);
                return;
            }
        }
    }
}

/// Renders ready responses into the write buffer and writes to the socket.
pub(crate) struct WriteService {
    core: Rc<WorkerCore>,
    input: QueueReader<Rc<Connection>>,
}

impl WriteService {
    pub(crate) fn new(core: Rc<WorkerCore>, input: QueueReader<Rc<Connection>>) -> Self {
        Self { core, input }
    }

    fn wake_parked_handler(&self, conn: &Rc<Connection>) {
        if conn.handler_parked().replace(false) {
            self.core.ready.mark_ready(HANDLE_SERVICE);
        }
    }

    /// Renders queued responses while they fit, then flushes. Returns
    /// false when the connection is finished for now (closed, or waiting
    /// for write readiness).
    fn fill_and_flush(&self, conn: &Rc<Connection>) -> bool {
        // Fill: drain the ready-response queue into the buffer while each
        // complete rendering fits.
        while let Some(response) = conn.pop_response() {
            let rendered = {
                let mut slot = conn.write_buf().borrow_mut();
                let buf = slot.as_mut().expect("write buffer acquired above");
                let mut common = self.core.common_headers.borrow_mut();
                let block = common.refreshed(SystemTime::now());
                render_response(buf, block, &response)
            };
            if rendered {
                self.wake_parked_handler(conn);
                continue;
            }
            let buffer_empty = conn
                .write_buf()
                .borrow()
                .as_ref()
                .map_or(true, PooledBuf::is_empty);
            if buffer_empty {
                // Even an empty buffer cannot hold this response; the
                // server does not chunk.
                let size = response.output_size() + self.core.common_headers.borrow().len();
                let capacity = self.core.conn_buffers.buf_capacity();
                conn.close(&CloseReason::ResponseTooLarge { size, capacity });
                return false;
            }
            conn.push_front_response(response);
            break;
        }

        // Flush the rendered bytes.
        loop {
            let write_result: io::Result<usize> = {
                let mut slot = conn.write_buf().borrow_mut();
                let buf = slot.as_mut().expect("write buffer present while flushing");
                if buf.is_empty() {
                    return true;
                }
                let mut stream = conn.stream();
                match stream.write(buf.filled()) {
                    Ok(n) => {
                        buf.consume(n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            };
            match write_result {
                Ok(0) => {
                    conn.close(&CloseReason::WriteFailed);
                    return false;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Partial write: keep the buffer and resume on the
                    // next write-ready event.
                    conn.request_interest(Interest::WRITABLE);
                    return false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    conn.close(&CloseReason::WriteFailed);
                    return false;
                }
            }
        }
    }

    fn process(&self, conn: &Rc<Connection>) {
        if conn.is_closed() {
            return;
        }
        conn.ensure_write_buf(&self.core.conn_buffers);
        loop {
            if !self.fill_and_flush(conn) {
                return;
            }
            if !conn.has_ready_responses() {
                break;
            }
        }
        conn.release_write_buf_if_empty();
        self.wake_parked_handler(conn);
        if conn.close_pending().get()
            && !conn.has_pending_requests()
            && !conn.has_ready_responses()
        {
            conn.close(&CloseReason::RequestedByPeer);
        }
    }
}

impl Service for WriteService {
    fn name(&self) -> &'static str {
        "ResponseWriterService"
    }

    fn run(&mut self) {
        while let Some(conn) = self.input.pop() {
            conn.write_queued().set(false);
            self.process(&conn);
        }
    }
}
