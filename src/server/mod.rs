//! The server front-end: listener setup, worker spawning, connection
//! distribution, and handler registration.
//!
//! Two distribution strategies are supported. The default runs one shared
//! listen socket behind a dedicated acceptor thread that hands accepted
//! sockets to workers in rotation. With `reuse_port` enabled, every worker
//! owns its own `SO_REUSEPORT` listen socket and performs accepts locally,
//! so no distribution strategy is needed.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::queue::inbox;
use crate::reactor::{Events, Interest, Selector, SelectorWaker, Token};
use crate::stats::ServerStats;
use crate::worker::{Worker, WorkerMessage};

/// Builds a non-blocking listen socket with the requested backlog.
/// `reuse_port` additionally sets `SO_REUSEPORT` so sibling sockets can
/// bind the same address.
fn build_listener(addr: SocketAddr, backlog: i32, reuse_port: bool) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

struct WorkerHandle {
    sender: inbox::Sender<WorkerMessage>,
    waker: SelectorWaker,
    thread: Option<JoinHandle<()>>,
}

/// Rotates accepted sockets across the workers.
pub(crate) struct RoundRobinDistribution {
    targets: Vec<(inbox::Sender<WorkerMessage>, SelectorWaker)>,
    next: AtomicUsize,
}

impl RoundRobinDistribution {
    pub(crate) fn new(targets: Vec<(inbox::Sender<WorkerMessage>, SelectorWaker)>) -> Self {
        assert!(!targets.is_empty());
        Self {
            targets,
            next: AtomicUsize::new(0),
        }
    }

    /// Hands `stream` to the next worker in rotation, blocking while that
    /// worker's inbox is full.
    pub(crate) fn dispatch(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        let (sender, waker) = &self.targets[idx];
        match sender.send(WorkerMessage::Connection(stream, peer)) {
            Ok(()) => {
                let _ = waker.wake();
            }
            Err(_) => {
                tracing::warn!(worker = idx, "worker inbox gone; dropping accepted socket");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn next_index(&self) -> usize {
        self.next.load(Ordering::Relaxed) % self.targets.len()
    }
}

struct AcceptorHandle {
    stop: Arc<AtomicBool>,
    waker: SelectorWaker,
    thread: Option<JoinHandle<()>>,
}

/// The dedicated acceptor loop (single-socket mode). Runs until the stop
/// flag is raised; a selector wake interrupts a pending poll so shutdown
/// is prompt.
fn acceptor_loop(
    listener: &TcpListener,
    selector: &Selector,
    dist: &RoundRobinDistribution,
    stop: &AtomicBool,
) {
    let fd = listener.as_raw_fd();
    let token = Token(0);
    if let Err(e) = selector.register(fd, token, Interest::READABLE) {
        tracing::error!(error = %e, "acceptor failed to register listener");
        return;
    }
    let mut events = Events::with_capacity(4);
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match selector.poll(&mut events, None) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "acceptor poll failed");
                break;
            }
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => dist.dispatch(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        if let Err(e) = selector.rearm(fd, token, Interest::READABLE) {
            tracing::error!(error = %e, "acceptor listener rearm failed");
            break;
        }
    }
    tracing::debug!("acceptor stopped");
}

/// A running HTTP server.
///
/// Dropping the server performs a graceful shutdown: every worker closes
/// its connections, releases its buffers, and exits.
pub struct Server {
    workers: Vec<WorkerHandle>,
    acceptor: Option<AcceptorHandle>,
    stats: Arc<ServerStats>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the configured address and spawns the workers (plus the
    /// acceptor thread unless `reuse_port` is set).
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(ServerStats::default());
        let mut workers = Vec::with_capacity(config.worker_count);

        let (local_addr, acceptor) = if config.reuse_port {
            let mut local_addr = None;
            for id in 0..config.worker_count {
                let listener = build_listener(
                    // Workers after the first must bind the concrete port
                    // the first one was assigned.
                    local_addr.unwrap_or(config.address),
                    config.listen_backlog,
                    true,
                )
                .map_err(Error::from)?;
                if local_addr.is_none() {
                    local_addr = Some(listener.local_addr().map_err(Error::from)?);
                }
                workers.push(spawn_worker(
                    id,
                    config.clone(),
                    Arc::clone(&stats),
                    Some(listener),
                )?);
            }
            let local_addr =
                local_addr.unwrap_or_else(|| unreachable!("worker_count validated >= 1"));
            (local_addr, None)
        } else {
            let listener = build_listener(config.address, config.listen_backlog, false)
                .map_err(Error::from)?;
            let local_addr = listener.local_addr().map_err(Error::from)?;
            for id in 0..config.worker_count {
                workers.push(spawn_worker(id, config.clone(), Arc::clone(&stats), None)?);
            }
            let targets = workers
                .iter()
                .map(|w| (w.sender.clone(), w.waker.clone()))
                .collect();
            let dist = RoundRobinDistribution::new(targets);
            let acceptor = spawn_acceptor(listener, dist)?;
            (local_addr, Some(acceptor))
        };

        tracing::info!(
            address = %local_addr,
            workers = config.worker_count,
            reuse_port = config.reuse_port,
            "server started"
        );
        Ok(Self {
            workers,
            acceptor,
            stats,
            local_addr,
        })
    }

    /// The address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server's shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Binds `path` to `handler` on every worker.
    ///
    /// The binding is broadcast to each worker's inbox and applied on the
    /// worker's own thread; lookups are exact matches on the request path.
    pub fn register_url_handler(&self, path: impl Into<String>, handler: Arc<dyn Handler>) {
        self.register_url_handlers(vec![(path.into(), handler)]);
    }

    /// Bulk variant of [`register_url_handler`](Self::register_url_handler).
    pub fn register_url_handlers(&self, routes: Vec<(String, Arc<dyn Handler>)>) {
        for worker in &self.workers {
            if worker
                .sender
                .send(WorkerMessage::Register(routes.clone()))
                .is_err()
            {
                tracing::warn!("worker inbox gone; registration not delivered");
                continue;
            }
            let _ = worker.waker.wake();
        }
    }

    /// Gracefully shuts the server down and waits for every thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    /// Blocks until the server threads exit.
    pub fn join(mut self) {
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(acceptor) = &mut self.acceptor {
            acceptor.stop.store(true, Ordering::Release);
            let _ = acceptor.waker.wake();
            if let Some(thread) = acceptor.thread.take() {
                let _ = thread.join();
            }
        }
        for worker in &mut self.workers {
            if worker.thread.is_some() {
                let _ = worker.sender.send(WorkerMessage::Shutdown);
                let _ = worker.waker.wake();
            }
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn spawn_worker(
    id: usize,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    listener: Option<TcpListener>,
) -> Result<WorkerHandle> {
    let selector = Selector::new().map_err(Error::from)?;
    let waker = selector.waker();
    let (sender, receiver) = inbox::channel(config.accept_inbox_capacity);
    let thread = std::thread::Builder::new()
        .name(format!("weft-worker-{id}"))
        .spawn(move || match Worker::new(id, config, stats, selector, receiver, listener) {
            Ok(mut worker) => worker.run(),
            Err(e) => tracing::error!(worker = id, error = %e, "worker failed to start"),
        })
        .map_err(Error::from)?;
    Ok(WorkerHandle {
        sender,
        waker,
        thread: Some(thread),
    })
}

fn spawn_acceptor(listener: TcpListener, dist: RoundRobinDistribution) -> Result<AcceptorHandle> {
    let selector = Selector::new().map_err(Error::from)?;
    let waker = selector.waker();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name("weft-acceptor".to_owned())
        .spawn(move || acceptor_loop(&listener, &selector, &dist, &stop_flag))
        .map_err(Error::from)?;
    Ok(AcceptorHandle {
        stop,
        waker,
        thread: Some(thread),
    })
}
