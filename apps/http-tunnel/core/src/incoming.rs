use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_BOUNDS: usize = usize::MAX;

/// Inbound messages waiting to be handed to the application.
///
/// Delivery runs on a dedicated task and pauses while the owner is not
/// readable. `capacity` is advisory (see [`IncomingBuffer::over_capacity`]);
/// `bounds` is the hard limit past which [`IncomingBuffer::offer`] refuses.
///
/// Must be created inside a Tokio runtime.
pub struct IncomingBuffer<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    capacity: AtomicUsize,
    bounds: AtomicUsize,
    readable: AtomicBool,
    wake: Notify,
}

struct Inner<T> {
    queue: VecDeque<T>,
    deliver: Box<dyn FnMut(T) + Send>,
    closed: bool,
}

impl<T: Send + 'static> IncomingBuffer<T> {
    pub fn new<F>(deliver: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_BOUNDS, deliver)
    }

    pub fn with_limits<F>(capacity: usize, bounds: usize, deliver: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                deliver: Box::new(deliver),
                closed: false,
            }),
            capacity: AtomicUsize::new(capacity),
            bounds: AtomicUsize::new(bounds),
            readable: AtomicBool::new(true),
            wake: Notify::new(),
        });
        tokio::spawn(run_consumer(Arc::clone(&shared)));
        Self { shared }
    }

    /// Queues an item unless the hard bound is reached or the buffer closed.
    pub fn offer(&self, item: T) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed || inner.queue.len() >= self.shared.bounds.load(Ordering::Relaxed) {
                return false;
            }
            inner.queue.push_back(item);
        }
        self.shared.wake.notify_one();
        true
    }

    pub fn over_capacity(&self) -> bool {
        self.len() > self.shared.capacity.load(Ordering::Relaxed)
    }

    /// Resumes delivery when `readable` is true, pauses it otherwise.
    pub fn on_interest_ops_changed(&self, readable: bool) {
        self.shared.readable.store(readable, Ordering::Release);
        if readable {
            self.shared.wake.notify_one();
        }
    }

    pub fn is_readable(&self) -> bool {
        self.shared.readable.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Relaxed)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.shared.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn bounds(&self) -> usize {
        self.shared.bounds.load(Ordering::Relaxed)
    }

    pub fn set_bounds(&self, bounds: usize) {
        self.shared.bounds.store(bounds, Ordering::Relaxed);
    }

    /// Delivers everything queued right now when the owner is readable.
    pub fn flush(&self) {
        if !self.is_readable() {
            return;
        }
        let mut inner = self.shared.inner.lock();
        while let Some(item) = inner.queue.pop_front() {
            (inner.deliver)(item);
        }
    }

    /// Stops delivery. Queued items still reach the consumer when the owner
    /// is readable and are dropped otherwise. Returns how many were dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            let pending: Vec<T> = inner.queue.drain(..).collect();
            if self.is_readable() {
                for item in pending {
                    (inner.deliver)(item);
                }
                0
            } else {
                pending.len()
            }
        };
        self.shared.wake.notify_one();
        dropped
    }
}

impl<T> Drop for IncomingBuffer<T> {
    fn drop(&mut self) {
        self.shared.inner.lock().closed = true;
        self.shared.wake.notify_one();
    }
}

async fn run_consumer<T>(shared: Arc<Shared<T>>) {
    loop {
        {
            let mut inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            if shared.readable.load(Ordering::Acquire) {
                if let Some(item) = inner.queue.pop_front() {
                    (inner.deliver)(item);
                    continue;
                }
            }
        }
        shared.wake.notified().await;
    }
}
