//! The per-worker cooperative scheduler.
//!
//! A worker is one OS thread owning a selector, a ready list, the four
//! pipeline services, and a disjoint set of connections. The main loop
//! interleaves I/O readiness with service work:
//!
//! 1. retry deferred offers left over from a momentarily full queue;
//! 2. poll the selector — blocking with the configured timeout when no
//!    service is ready, non-blocking otherwise;
//! 3. route each readiness event to the right service queue;
//! 4. drain the cross-thread inbox (accepted sockets, registry updates,
//!    shutdown);
//! 5. run one ready service to suspension.
//!
//! Nothing inside a worker is locked; every connection is mutated only on
//! this thread.

pub(crate) mod pipeline;
pub(crate) mod service;

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crate::buffer::BufferPool;
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::CloseReason;
use crate::handler::{Handler, HandlerRegistry};
use crate::http::date::CommonHeaders;
use crate::queue::{inbox, service_queue, QueueWriter, ReadyList};
use crate::reactor::{Event, Events, Interest, Selector, Token};
use crate::stats::ServerStats;
use crate::worker::pipeline::{AcceptService, HandleService, ReadService, WriteService};
use crate::worker::service::{
    Service, ACCEPT_SERVICE, HANDLE_SERVICE, READ_SERVICE, SERVICE_COUNT, WRITE_SERVICE,
};

/// Selector token of the worker-local listen socket (reuseport mode).
const LISTENER_TOKEN: usize = 0;
/// First token handed to connections.
const FIRST_CONN_TOKEN: usize = 1;
/// Selector event batch size.
const EVENT_CAPACITY: usize = 1024;

/// The `Server:` header value stamped on every response.
pub(crate) const SERVER_NAME: &str = concat!("weft/", env!("CARGO_PKG_VERSION"));

/// A freshly accepted socket on its way to `ConnectionAcceptService`.
pub(crate) struct AcceptedSocket {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
}

/// Control and handoff messages delivered through a worker's inbox.
pub(crate) enum WorkerMessage {
    /// A socket accepted on another thread, to be adopted by this worker.
    Connection(TcpStream, SocketAddr),
    /// URL-handler bindings to apply to this worker's registry.
    Register(Vec<(String, Arc<dyn Handler>)>),
    /// Begin graceful shutdown.
    Shutdown,
}

impl std::fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMessage::Connection(_, peer) => {
                f.debug_tuple("Connection").field(peer).finish()
            }
            WorkerMessage::Register(bindings) => {
                f.debug_tuple("Register").field(&bindings.len()).finish()
            }
            WorkerMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Offers that found a service queue momentarily full; retried by the
/// worker loop so no readiness signal or socket is ever dropped.
pub(crate) enum DeferredWork {
    OfferRead(Rc<Connection>),
    OfferWrite(Rc<Connection>),
    Accepted(AcceptedSocket),
}

/// Queue writers aimed at each pipeline service. Obtained lazily exactly
/// once, at worker construction, then stable for the worker's lifetime.
pub(crate) struct PipelineWriters {
    pub(crate) accept: QueueWriter<AcceptedSocket>,
    pub(crate) read: QueueWriter<Rc<Connection>>,
    pub(crate) handle: QueueWriter<Rc<Connection>>,
    pub(crate) write: QueueWriter<Rc<Connection>>,
}

/// State shared between the worker loop, its services, and its
/// connections. Single-threaded; reached through `Rc`.
pub(crate) struct WorkerCore {
    pub(crate) id: usize,
    owner: ThreadId,
    pub(crate) selector: Selector,
    pub(crate) ready: ReadyList,
    pub(crate) conns: RefCell<HashMap<usize, Rc<Connection>>>,
    pub(crate) conn_buffers: BufferPool,
    pub(crate) handshake_buffers: BufferPool,
    pub(crate) registry: RefCell<HandlerRegistry>,
    pub(crate) common_headers: RefCell<CommonHeaders>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) config: ServerConfig,
    writers: OnceCell<PipelineWriters>,
    next_token: Cell<usize>,
    shutting_down: Cell<bool>,
    deferred: RefCell<VecDeque<DeferredWork>>,
}

impl WorkerCore {
    /// Asserts the caller is on this worker's thread. Mutating a
    /// connection off-thread is a scheduler bug.
    pub(crate) fn assert_owner(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "connection state mutated off its owning worker thread"
        );
    }

    pub(crate) fn writers(&self) -> &PipelineWriters {
        self.writers
            .get()
            .expect("pipeline writers are installed before the worker runs")
    }

    pub(crate) fn defer(&self, work: DeferredWork) {
        self.deferred.borrow_mut().push_back(work);
    }

    pub(crate) fn alloc_token(&self) -> Token {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        Token(token)
    }
}

/// A worker: scheduler loop plus its services. Lives entirely on its own
/// thread.
pub(crate) struct Worker {
    core: Rc<WorkerCore>,
    services: Vec<Box<dyn Service>>,
    inbox: inbox::Receiver<WorkerMessage>,
    listener: Option<TcpListener>,
    events: Events,
}

impl Worker {
    /// Builds the worker on its own thread. `listener` is present in
    /// reuseport mode only.
    pub(crate) fn new(
        id: usize,
        config: ServerConfig,
        stats: Arc<ServerStats>,
        selector: Selector,
        inbox: inbox::Receiver<WorkerMessage>,
        listener: Option<TcpListener>,
    ) -> io::Result<Self> {
        let ready = ReadyList::new(SERVICE_COUNT);
        let queue_cap = config.service_queue_capacity;
        let (accept_tx, accept_rx) = service_queue(queue_cap, ACCEPT_SERVICE, &ready);
        let (read_tx, read_rx) = service_queue(queue_cap, READ_SERVICE, &ready);
        let (handle_tx, handle_rx) = service_queue(queue_cap, HANDLE_SERVICE, &ready);
        let (write_tx, write_rx) = service_queue(queue_cap, WRITE_SERVICE, &ready);

        let core = Rc::new(WorkerCore {
            id,
            owner: std::thread::current().id(),
            selector,
            ready,
            conns: RefCell::new(HashMap::new()),
            conn_buffers: BufferPool::new(config.connection_buffer_size, Arc::clone(&stats)),
            handshake_buffers: BufferPool::new(config.handshake_buffer_size, Arc::clone(&stats)),
            registry: RefCell::new(HandlerRegistry::new()),
            common_headers: RefCell::new(CommonHeaders::new(SERVER_NAME)),
            stats,
            config,
            writers: OnceCell::new(),
            next_token: Cell::new(FIRST_CONN_TOKEN),
            shutting_down: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
        });
        let writers = PipelineWriters {
            accept: accept_tx,
            read: read_tx,
            handle: handle_tx,
            write: write_tx,
        };
        if core.writers.set(writers).is_err() {
            unreachable!("pipeline writers installed twice");
        }

        let services: Vec<Box<dyn Service>> = vec![
            Box::new(AcceptService::new(Rc::clone(&core), accept_rx)),
            Box::new(ReadService::new(Rc::clone(&core), read_rx)),
            Box::new(HandleService::new(Rc::clone(&core), handle_rx)),
            Box::new(WriteService::new(Rc::clone(&core), write_rx)),
        ];

        if let Some(listener) = &listener {
            listener.set_nonblocking(true)?;
            core.selector.register(
                listener.as_raw_fd(),
                Token(LISTENER_TOKEN),
                Interest::READABLE,
            )?;
        }

        Ok(Self {
            core,
            services,
            inbox,
            listener,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    /// The scheduler loop. Returns after a shutdown message.
    pub(crate) fn run(&mut self) {
        tracing::info!(worker = self.core.id, "worker started");
        loop {
            if self.core.shutting_down.get() {
                break;
            }
            self.retry_deferred();

            let idle = self.core.ready.is_empty() && self.core.deferred.borrow().is_empty();
            let timeout = if idle {
                self.core.config.poll_timeout
            } else {
                Duration::ZERO
            };
            match self.core.selector.poll(&mut self.events, Some(timeout)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(worker = self.core.id, error = %e, "selector poll failed");
                    break;
                }
            }

            for i in 0..self.events.len() {
                if let Some(event) = self.events.get(i) {
                    self.process_event(event);
                }
            }

            self.drain_inbox();

            if let Some(id) = self.core.ready.pop() {
                let service = &mut self.services[id];
                tracing::trace!(worker = self.core.id, service = service.name(), "running service");
                service.run();
            }
        }
        self.shutdown_drain();
    }

    /// Routes one readiness event into the pipeline.
    fn process_event(&mut self, event: Event) {
        if event.token.0 == LISTENER_TOKEN {
            self.drain_accepts();
            return;
        }
        let conn = self.core.conns.borrow().get(&event.token.0).cloned();
        let Some(conn) = conn else {
            // Stale event for an already-closed connection.
            return;
        };

        // Delivery is oneshot: the armed interest set was consumed.
        let armed = conn.take_armed();

        if event.ready.is_readable() && !conn.read_queued().get() {
            conn.read_queued().set(true);
            if let Err(c) = self.core.writers().read.offer(Rc::clone(&conn)) {
                self.core.defer(DeferredWork::OfferRead(c));
            }
        }
        if event.ready.is_writable() && !conn.write_queued().get() {
            conn.write_queued().set(true);
            if let Err(c) = self.core.writers().write.offer(Rc::clone(&conn)) {
                self.core.defer(DeferredWork::OfferWrite(c));
            }
        }

        // Interest that was armed but not delivered must be re-armed.
        let leftover = armed.remove(event.ready);
        if !leftover.is_empty() {
            conn.request_interest(leftover);
        }
    }

    /// Drains the worker-local listener (reuseport mode) into the accept
    /// service.
    fn drain_accepts(&mut self) {
        let Some(listener) = &self.listener else {
            debug_assert!(false, "listener readiness without a listener");
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let sock = AcceptedSocket { stream, peer };
                    if let Err(sock) = self.core.writers().accept.offer(sock) {
                        self.core.defer(DeferredWork::Accepted(sock));
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(worker = self.core.id, error = %e, "accept failed");
                    break;
                }
            }
        }
        if let Err(e) = self.core.selector.rearm(
            listener.as_raw_fd(),
            Token(LISTENER_TOKEN),
            Interest::READABLE,
        ) {
            tracing::error!(worker = self.core.id, error = %e, "listener rearm failed");
        }
    }

    /// Applies inbox messages: adopted sockets, registry updates,
    /// shutdown.
    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Some(WorkerMessage::Connection(stream, peer)) => {
                    let sock = AcceptedSocket { stream, peer };
                    if let Err(sock) = self.core.writers().accept.offer(sock) {
                        self.core.defer(DeferredWork::Accepted(sock));
                        break;
                    }
                }
                Some(WorkerMessage::Register(routes)) => {
                    let mut registry = self.core.registry.borrow_mut();
                    let count = routes.len();
                    for (path, handler) in routes {
                        registry.insert(path, handler);
                    }
                    tracing::debug!(worker = self.core.id, count, "url handlers registered");
                }
                Some(WorkerMessage::Shutdown) => {
                    self.core.shutting_down.set(true);
                }
                None => break,
            }
        }
    }

    /// Retries offers that previously hit a full service queue, in order.
    fn retry_deferred(&mut self) {
        let mut work = std::mem::take(&mut *self.core.deferred.borrow_mut());
        while let Some(item) = work.pop_front() {
            let failed = match item {
                DeferredWork::OfferRead(c) => self
                    .core
                    .writers()
                    .read
                    .offer(c)
                    .err()
                    .map(DeferredWork::OfferRead),
                DeferredWork::OfferWrite(c) => self
                    .core
                    .writers()
                    .write
                    .offer(c)
                    .err()
                    .map(DeferredWork::OfferWrite),
                DeferredWork::Accepted(s) => self
                    .core
                    .writers()
                    .accept
                    .offer(s)
                    .err()
                    .map(DeferredWork::Accepted),
            };
            if let Some(item) = failed {
                work.push_front(item);
                break;
            }
        }
        if !work.is_empty() {
            let mut deferred = self.core.deferred.borrow_mut();
            while let Some(item) = work.pop_back() {
                deferred.push_front(item);
            }
        }
    }

    /// Closes every owned connection and drains the services once.
    /// Individual close errors are swallowed so one bad socket cannot
    /// prevent closing the rest.
    fn shutdown_drain(&mut self) {
        let conns: Vec<Rc<Connection>> = self.core.conns.borrow().values().cloned().collect();
        for conn in conns {
            conn.close(&CloseReason::ServerShutdown);
        }
        for service in &mut self.services {
            service.run();
        }
        debug_assert!(self.core.conns.borrow().is_empty());
        debug_assert_eq!(self.core.conn_buffers.in_use(), 0);
        debug_assert_eq!(self.core.handshake_buffers.in_use(), 0);
        tracing::info!(worker = self.core.id, "worker stopped");
    }
}
