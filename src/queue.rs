//! Bounded single-producer/single-consumer queues.
//!
//! Two flavors serve the two kinds of traffic in the server:
//!
//! - [`service_queue`] wires services together *inside* a worker. It is
//!   single-threaded (`Rc`-based) and lock-free by construction. `offer` is
//!   a non-blocking try-enqueue; when it fails the producing service parks
//!   itself on the queue and is re-readied the moment the consumer frees a
//!   slot. Nothing is ever dropped.
//! - [`inbox`] carries the acceptor-to-worker handoff and control messages
//!   *across* threads. `send` blocks the producing thread while the queue
//!   is full.
//!
//! [`ReadyList`] is the scheduler's ready set: marking a service ready is
//! idempotent, so repeated wakes while it is already queued are no-ops.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Index of a service in its worker's service list.
pub type ServiceId = usize;

#[derive(Debug)]
struct ReadyInner {
    order: VecDeque<ServiceId>,
    queued: Vec<bool>,
}

/// The scheduler's ready set.
///
/// A service appears at most once; [`ReadyList::mark_ready`] on an
/// already-queued service is a no-op.
#[derive(Debug, Clone)]
pub struct ReadyList {
    inner: Rc<RefCell<ReadyInner>>,
}

impl ReadyList {
    /// Creates a ready list for `service_count` services.
    #[must_use]
    pub fn new(service_count: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReadyInner {
                order: VecDeque::with_capacity(service_count),
                queued: vec![false; service_count],
            })),
        }
    }

    /// Marks a service ready. Idempotent.
    pub fn mark_ready(&self, id: ServiceId) {
        let mut inner = self.inner.borrow_mut();
        if !inner.queued[id] {
            inner.queued[id] = true;
            inner.order.push_back(id);
        }
    }

    /// Pops the next ready service, if any.
    pub fn pop(&self) -> Option<ServiceId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.order.pop_front()?;
        inner.queued[id] = false;
        Some(id)
    }

    /// Returns true if no service is ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().order.is_empty()
    }
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    consumer: ServiceId,
    parked_producer: Option<ServiceId>,
}

/// Creates an in-worker bounded SPSC queue feeding the service `consumer`.
///
/// The writer marks `consumer` ready on every empty-to-non-empty
/// transition; the reader wakes a parked producer on every full-to-not-full
/// transition.
pub fn service_queue<T>(
    capacity: usize,
    consumer: ServiceId,
    ready: &ReadyList,
) -> (QueueWriter<T>, QueueReader<T>) {
    assert!(capacity > 0, "service queue capacity must be non-zero");
    let inner = Rc::new(RefCell::new(QueueInner {
        items: VecDeque::with_capacity(capacity),
        capacity,
        consumer,
        parked_producer: None,
    }));
    (
        QueueWriter {
            inner: Rc::clone(&inner),
            ready: ready.clone(),
        },
        QueueReader {
            inner,
            ready: ready.clone(),
        },
    )
}

/// Producing side of an in-worker service queue.
#[derive(Debug)]
pub struct QueueWriter<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
    ready: ReadyList,
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            ready: self.ready.clone(),
        }
    }
}

impl<T> QueueWriter<T> {
    /// Non-blocking try-enqueue. Returns the item when the queue is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.borrow_mut();
        if inner.items.len() == inner.capacity {
            return Err(item);
        }
        let was_empty = inner.items.is_empty();
        inner.items.push_back(item);
        let consumer = inner.consumer;
        drop(inner);
        if was_empty {
            self.ready.mark_ready(consumer);
        }
        Ok(())
    }

    /// The cooperative `send`: offer, and on a full queue park `producer`
    /// until the consumer frees a slot.
    ///
    /// On `Err` the caller keeps the item and must suspend; it will be
    /// re-readied and is expected to retry delivery first.
    pub fn offer_or_park(&self, item: T, producer: ServiceId) -> Result<(), T> {
        match self.offer(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                self.inner.borrow_mut().parked_producer = Some(producer);
                Err(item)
            }
        }
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }
}

/// Consuming side of an in-worker service queue.
#[derive(Debug)]
pub struct QueueReader<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
    ready: ReadyList,
}

impl<T> QueueReader<T> {
    /// Pops the next item, waking a parked producer when a slot frees up.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        let was_full = inner.items.len() == inner.capacity;
        let item = inner.items.pop_front()?;
        let woken = if was_full {
            inner.parked_producer.take()
        } else {
            None
        };
        drop(inner);
        if let Some(producer) = woken {
            self.ready.mark_ready(producer);
        }
        Some(item)
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }
}

pub mod inbox {
    //! Cross-thread bounded SPSC handoff queue.
    //!
    //! Carries accepted sockets and control messages from the acceptor /
    //! server threads into a worker. The producing side blocks when the
    //! queue is full; the consuming side never blocks (the worker polls it
    //! after every selector pass).

    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct State<T> {
        items: VecDeque<T>,
        receiver_alive: bool,
    }

    struct Shared<T> {
        state: Mutex<State<T>>,
        capacity: usize,
        not_full: Condvar,
    }

    /// Creates a bounded cross-thread handoff queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        assert!(capacity > 0, "inbox capacity must be non-zero");
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                receiver_alive: true,
            }),
            capacity,
            not_full: Condvar::new(),
        });
        (
            Sender {
                shared: Arc::clone(&shared),
            },
            Receiver { shared },
        )
    }

    /// Error returned when the receiving worker is gone.
    #[derive(Debug)]
    pub struct Disconnected<T>(pub T);

    /// Producing side of an inbox.
    pub struct Sender<T> {
        shared: Arc<Shared<T>>,
    }

    impl<T> Clone for Sender<T> {
        fn clone(&self) -> Self {
            Self {
                shared: Arc::clone(&self.shared),
            }
        }
    }

    impl<T> Sender<T> {
        /// Enqueues `item`, blocking while the queue is full.
        pub fn send(&self, item: T) -> Result<(), Disconnected<T>> {
            let mut state = self.shared.state.lock();
            loop {
                if !state.receiver_alive {
                    return Err(Disconnected(item));
                }
                if state.items.len() < self.shared.capacity {
                    state.items.push_back(item);
                    return Ok(());
                }
                self.shared.not_full.wait(&mut state);
            }
        }

        /// Non-blocking try-enqueue.
        pub fn offer(&self, item: T) -> Result<(), Disconnected<T>> {
            let mut state = self.shared.state.lock();
            if !state.receiver_alive {
                return Err(Disconnected(item));
            }
            if state.items.len() == self.shared.capacity {
                return Err(Disconnected(item));
            }
            state.items.push_back(item);
            Ok(())
        }
    }

    /// Consuming side of an inbox.
    pub struct Receiver<T> {
        shared: Arc<Shared<T>>,
    }

    impl<T> Receiver<T> {
        /// Pops the next item without blocking.
        pub fn try_recv(&self) -> Option<T> {
            let mut state = self.shared.state.lock();
            let item = state.items.pop_front();
            if item.is_some() {
                self.shared.not_full.notify_one();
            }
            item
        }
    }

    impl<T> Drop for Receiver<T> {
        fn drop(&mut self) {
            self.shared.state.lock().receiver_alive = false;
            self.shared.not_full.notify_all();
        }
    }
}
