use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::Notify, time::Instant};

/// An item in the queue, together with its estimated size.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedItem<T> {
    pub item: T,
    pub size_bytes: u64,
}

/// A FIFO queue bounded by the estimated size of its items.
///
/// Many producers insert into the queue, a single worker drains it.
/// Inserting into a full queue waits until the worker frees enough space.
#[derive(Debug)]
pub struct MemoryBoundedQueue<T> {
    capacity: u64,
    state: Mutex<QueueState<T>>,
    /// Notified when items are removed from the queue.
    space_available: Notify,
    /// Notified when items are added or a producer starts waiting for space.
    data_available: Notify,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<SizedItem<T>>,
    usage_bytes: u64,
    last_insert: Option<Instant>,
    waiting_producers: usize,
    closed: bool,
}

/// Keeps track of a producer waiting for space, also if its future is dropped.
struct WaitingProducer<'a, T> {
    queue: &'a MemoryBoundedQueue<T>,
}

impl<T> MemoryBoundedQueue<T> {
    /// Creates a new queue holding at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                usage_bytes: 0,
                last_insert: None,
                waiting_producers: 0,
                closed: false,
            }),
            space_available: Notify::new(),
            data_available: Notify::new(),
        }
    }

    /// Appends an item to the queue, waiting until there is enough space for it.
    ///
    /// An item larger than the queue capacity is accepted once the queue is empty.
    /// If the queue is closed the item is returned back.
    pub async fn insert(&self, item: T, size_bytes: u64) -> Result<(), T> {
        let mut waiting: Option<WaitingProducer<'_, T>> = None;

        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            // Register before checking the state so that a drain in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();

                if state.closed {
                    return Err(item);
                }

                if state.admits(size_bytes, self.capacity) {
                    state.usage_bytes += size_bytes;
                    state.last_insert = Some(Instant::now());
                    state.items.push_back(SizedItem { item, size_bytes });
                    drop(state);

                    self.data_available.notify_one();
                    return Ok(());
                }

                if waiting.is_none() {
                    state.waiting_producers += 1;
                    drop(state);

                    waiting = Some(WaitingProducer { queue: self });
                    // Let the worker know the queue is holding back a producer.
                    self.data_available.notify_one();
                }
            }

            notified.await;
        }
    }

    /// Removes up to `max_items` of the oldest items, stopping before their total
    /// size exceeds `max_bytes`.
    ///
    /// Returns at least one item if the queue is not empty, even if `max_items` is zero.
    pub fn drain_up_to(&self, max_items: usize, max_bytes: u64) -> Vec<SizedItem<T>> {
        let max_items = max_items.max(1);
        let mut drained = Vec::new();
        let mut drained_bytes = 0;

        {
            let mut state = self.lock_state();

            while drained.len() < max_items {
                let Some(front) = state.items.front() else {
                    break;
                };

                if !drained.is_empty() && drained_bytes + front.size_bytes > max_bytes {
                    break;
                }

                let Some(entry) = state.items.pop_front() else {
                    break;
                };

                drained_bytes += entry.size_bytes;
                state.usage_bytes -= entry.size_bytes;
                drained.push(entry);
            }
        }

        if !drained.is_empty() {
            self.space_available.notify_waiters();
        }

        drained
    }

    /// Waits until an item is inserted, a producer starts waiting for space or the
    /// deadline passes.
    ///
    /// A notification sent while nobody was waiting wakes the next call immediately,
    /// so callers must check the queue state again after returning.
    pub async fn wait_for_insert(&self, deadline: Instant) {
        let _ = tokio::time::timeout_at(deadline, self.data_available.notified()).await;
    }

    /// Removes all items from the queue, returning how many were removed.
    pub(crate) fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.lock_state();
            state.usage_bytes = 0;
            std::mem::take(&mut state.items).len()
        };

        self.space_available.notify_waiters();
        cleared
    }

    /// Closes the queue. Pending and future inserts fail.
    pub(crate) fn close(&self) {
        self.lock_state().closed = true;
        self.space_available.notify_waiters();
        self.data_available.notify_one();
    }

    /// The maximum number of bytes held by the queue.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The estimated size of the items currently in the queue.
    pub fn usage_bytes(&self) -> u64 {
        self.lock_state().usage_bytes
    }

    pub fn len(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().items.is_empty()
    }

    /// The time the last item was inserted, if any.
    pub fn time_of_last_insert(&self) -> Option<Instant> {
        self.lock_state().last_insert
    }

    /// Returns true if at least one producer is waiting for space.
    pub fn has_waiting_producers(&self) -> bool {
        self.lock_state().waiting_producers > 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        // The state is consistent after every critical section, so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> QueueState<T> {
    fn admits(&self, size_bytes: u64, capacity: u64) -> bool {
        self.items.is_empty() || self.usage_bytes + size_bytes <= capacity
    }
}

impl<T> Drop for WaitingProducer<'_, T> {
    fn drop(&mut self) {
        self.queue.lock_state().waiting_producers -= 1;
    }
}
