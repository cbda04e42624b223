use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{QueueError, Rejected, Result};

type Callback = Box<dyn FnOnce() + Send>;

/// Lifecycle of a [`HandoffQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting items.
    Open,
    /// No new items; buffered items can still be taken.
    Draining,
    /// Terminal; nothing is accepted or produced.
    Closed,
}

struct Entry<T> {
    value: T,
    on_dequeued: Option<Callback>,
}

impl<T> Entry<T> {
    /// Hand the value to its consumer, running the callback first.
    fn take(self) -> T {
        if let Some(callback) = self.on_dequeued {
            callback();
        }
        self.value
    }

    fn discard(self) {
        if let Some(callback) = self.on_dequeued {
            callback();
        }
    }
}

/// Delivery slot of one blocked reader. `Some(None)` means released.
struct Slot<T> {
    delivery: Mutex<Option<Option<Entry<T>>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            delivery: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn deliver(&self, entry: Option<Entry<T>>) {
        *lock(&self.delivery) = Some(entry);
        self.ready.notify_one();
    }
}

enum ReaderKind<T> {
    Blocking(Arc<Slot<T>>),
    #[cfg(feature = "async")]
    Async(tokio::sync::oneshot::Sender<Option<Entry<T>>>),
}

struct Reader<T> {
    id: u64,
    kind: ReaderKind<T>,
}

impl<T> Reader<T> {
    /// Hand `entry` to this reader. Gives the entry back if the reader is gone.
    fn deliver(self, entry: Entry<T>) -> std::result::Result<(), Entry<T>> {
        match self.kind {
            ReaderKind::Blocking(slot) => {
                slot.deliver(Some(entry));
                Ok(())
            }
            #[cfg(feature = "async")]
            ReaderKind::Async(tx) => match tx.send(Some(entry)) {
                Ok(()) => Ok(()),
                Err(Some(entry)) => Err(entry),
                Err(None) => Ok(()),
            },
        }
    }

    fn release(self) {
        match self.kind {
            ReaderKind::Blocking(slot) => slot.deliver(None),
            #[cfg(feature = "async")]
            ReaderKind::Async(tx) => {
                let _ = tx.send(None);
            }
        }
    }
}

struct Inner<T> {
    state: QueueState,
    items: VecDeque<Entry<T>>,
    readers: VecDeque<Reader<T>>,
    next_reader_id: u64,
}

impl<T> Inner<T> {
    fn register(&mut self, kind: ReaderKind<T>) -> u64 {
        self.next_reader_id += 1;
        let id = self.next_reader_id;
        self.readers.push_back(Reader { id, kind });
        id
    }

    /// Remove a still-pending reader registration.
    fn withdraw(&mut self, id: u64) -> bool {
        match self.readers.iter().position(|reader| reader.id == id) {
            Some(pos) => {
                self.readers.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Unbounded FIFO that hands items directly to waiting readers.
///
/// Producers never block. A consumer that finds the buffer empty registers
/// itself as a reader; the next enqueued item goes straight to the oldest
/// registered reader. Every item is delivered at most once, and its optional
/// `on_dequeued` callback runs exactly once, outside the queue lock, when the
/// item is taken by a consumer or discarded by [`close`](Self::close).
pub struct HandoffQueue<T> {
    inner: Mutex<Inner<T>>,
    item_available: Condvar,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffQueue<T> {
    /// Create an open, empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: QueueState::Open,
                items: VecDeque::new(),
                readers: VecDeque::new(),
                next_reader_id: 0,
            }),
            item_available: Condvar::new(),
        }
    }

    /// Enqueue an item, handing it to a waiting reader if there is one.
    pub fn enqueue_and_dispatch(&self, item: T) -> std::result::Result<(), Rejected<T>> {
        self.enqueue_entry(Entry {
            value: item,
            on_dequeued: None,
        })
    }

    /// Enqueue an item with a callback that runs once the item is taken.
    ///
    /// If the queue is no longer open the item is rejected and the callback
    /// runs immediately.
    pub fn enqueue_with_callback<F>(
        &self,
        item: T,
        on_dequeued: F,
    ) -> std::result::Result<(), Rejected<T>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_entry(Entry {
            value: item,
            on_dequeued: Some(Box::new(on_dequeued)),
        })
    }

    fn enqueue_entry(&self, mut entry: Entry<T>) -> std::result::Result<(), Rejected<T>> {
        let mut inner = self.lock();
        if inner.state != QueueState::Open {
            drop(inner);
            trace!("queue rejected item");
            return Err(Rejected(entry.take()));
        }

        while let Some(reader) = inner.readers.pop_front() {
            match reader.deliver(entry) {
                Ok(()) => return Ok(()),
                Err(returned) => entry = returned,
            }
        }

        inner.items.push_back(entry);
        drop(inner);
        self.item_available.notify_all();
        Ok(())
    }

    /// Take the next item, blocking up to `timeout` (`None` waits forever).
    ///
    /// Returns `Ok(None)` once the queue is drained or closed, and
    /// `Err(QueueError::Timeout)` if nothing arrived in time.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (id, slot) = {
            let mut inner = self.lock();
            if let Some(entry) = inner.items.pop_front() {
                drop(inner);
                return Ok(Some(entry.take()));
            }
            if inner.state != QueueState::Open {
                return Ok(None);
            }
            let slot = Arc::new(Slot::new());
            let id = inner.register(ReaderKind::Blocking(Arc::clone(&slot)));
            (id, slot)
        };

        {
            let mut delivery = lock(&slot.delivery);
            loop {
                if let Some(outcome) = delivery.take() {
                    drop(delivery);
                    return Ok(outcome.map(Entry::take));
                }
                match deadline {
                    None => {
                        delivery = slot
                            .ready
                            .wait(delivery)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        delivery = slot
                            .ready
                            .wait_timeout(delivery, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        }

        // Deliveries happen under the queue lock, so once the registration is
        // gone the slot is guaranteed to hold the outcome.
        let mut inner = self.lock();
        if inner.withdraw(id) {
            return Err(QueueError::Timeout);
        }
        drop(inner);
        let outcome = lock(&slot.delivery).take();
        Ok(outcome.flatten().map(Entry::take))
    }

    /// Take the next buffered item without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        let entry = self.lock().items.pop_front();
        entry.map(Entry::take)
    }

    /// Wait until an item is buffered without taking it.
    ///
    /// Returns `false` on timeout or once the queue can no longer produce
    /// items.
    pub fn wait_for_item(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if !inner.items.is_empty() {
                return true;
            }
            if inner.state != QueueState::Open {
                return false;
            }
            match deadline {
                None => {
                    inner = self
                        .item_available
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    inner = self
                        .item_available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Stop accepting items; buffered items stay available.
    ///
    /// Waiting readers are released with `None`.
    pub fn shutdown(&self) {
        let readers = {
            let mut inner = self.lock();
            if inner.state != QueueState::Open {
                return;
            }
            inner.state = QueueState::Draining;
            std::mem::take(&mut inner.readers)
        };
        trace!(released = readers.len(), "queue draining");
        for reader in readers {
            reader.release();
        }
        self.item_available.notify_all();
    }

    /// Close the queue: release every reader and discard buffered items.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let (readers, items) = {
            let mut inner = self.lock();
            if inner.state == QueueState::Closed {
                return;
            }
            inner.state = QueueState::Closed;
            (
                std::mem::take(&mut inner.readers),
                std::mem::take(&mut inner.items),
            )
        };
        trace!(
            released = readers.len(),
            discarded = items.len(),
            "queue closed"
        );
        for reader in readers {
            reader.release();
        }
        for entry in items {
            entry.discard();
        }
        self.item_available.notify_all();
    }

    /// Number of buffered items.
    pub fn pending_count(&self) -> usize {
        self.lock().items.len()
    }

    /// Number of readers currently waiting for an item.
    pub fn waiting_readers(&self) -> usize {
        self.lock().readers.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock(&self.inner)
    }
}

#[cfg(feature = "async")]
impl<T> HandoffQueue<T> {
    /// Async variant of [`dequeue`](Self::dequeue).
    ///
    /// Dropping the future before it completes cancels the registration. An
    /// item that raced into a cancelled registration goes back to the front
    /// of the buffer.
    pub async fn dequeue_async(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let mut pending = {
            let mut inner = self.lock();
            if let Some(entry) = inner.items.pop_front() {
                drop(inner);
                return Ok(Some(entry.take()));
            }
            if inner.state != QueueState::Open {
                return Ok(None);
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            let id = inner.register(ReaderKind::Async(tx));
            PendingRead {
                queue: self,
                id,
                rx,
                armed: true,
            }
        };

        let received = match timeout {
            None => (&mut pending.rx).await,
            Some(timeout) => match tokio::time::timeout(timeout, &mut pending.rx).await {
                Ok(received) => received,
                Err(_) => {
                    pending.armed = false;
                    return match self.withdraw_async(pending.id, &mut pending.rx) {
                        None => Err(QueueError::Timeout),
                        Some(outcome) => Ok(outcome.map(Entry::take)),
                    };
                }
            },
        };
        pending.armed = false;
        Ok(received.ok().flatten().map(Entry::take))
    }

    /// Withdraw an async registration. `None` if it was still pending,
    /// otherwise the outcome that was already delivered.
    fn withdraw_async(
        &self,
        id: u64,
        rx: &mut tokio::sync::oneshot::Receiver<Option<Entry<T>>>,
    ) -> Option<Option<Entry<T>>> {
        let mut inner = self.lock();
        if inner.withdraw(id) {
            return None;
        }
        drop(inner);
        Some(rx.try_recv().ok().flatten())
    }

    /// Give back an item whose reader went away: the next waiting reader
    /// gets it, otherwise it goes to the front of the buffer.
    fn requeue_front(&self, mut entry: Entry<T>) {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            drop(inner);
            entry.discard();
            return;
        }
        while let Some(reader) = inner.readers.pop_front() {
            match reader.deliver(entry) {
                Ok(()) => return,
                Err(returned) => entry = returned,
            }
        }
        inner.items.push_front(entry);
        drop(inner);
        self.item_available.notify_all();
    }
}

#[cfg(feature = "async")]
struct PendingRead<'a, T> {
    queue: &'a HandoffQueue<T>,
    id: u64,
    rx: tokio::sync::oneshot::Receiver<Option<Entry<T>>>,
    armed: bool,
}

#[cfg(feature = "async")]
impl<T> Drop for PendingRead<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(Some(entry)) = self.queue.withdraw_async(self.id, &mut self.rx) {
            self.queue.requeue_front(entry);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
