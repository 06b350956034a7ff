//! Async FIFO handoff queues between the interface side and the socket side.
//!
//! A [`PacketQueue`] is multi-producer/multi-consumer. Storage is a lock-free
//! `SegQueue`; consumers park on a `Notify` and producers on a `Semaphore` when
//! a bounded queue uses [`OverflowPolicy::Block`].
//!
//! FIFO order holds per producer. Items pushed concurrently by different
//! producers interleave in an unspecified order.

use crate::transport::{TransportError, TransportResult};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};

/// What to do when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Suspend the producer until a consumer frees a slot
    #[default]
    Block,
    /// Evict the oldest queued item to make room
    DropOldest,
}

/// Queue capacity policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueCapacity {
    /// No limit; a slow consumer lets the queue grow without bound
    #[default]
    Unbounded,
    /// At most `capacity` items, saturating according to `overflow`
    Bounded {
        /// Maximum queued items
        capacity: usize,
        /// Saturation policy
        overflow: OverflowPolicy,
    },
}

/// Thread-safe FIFO with async dequeue.
pub struct PacketQueue<T> {
    name: &'static str,
    items: SegQueue<T>,
    len: AtomicUsize,
    capacity: QueueCapacity,
    readable: Notify,
    /// Free slots, only present for `Bounded { overflow: Block }`
    slots: Option<Semaphore>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> PacketQueue<T> {
    /// Create a queue with the given capacity policy.
    ///
    /// # Panics
    ///
    /// Panics if a bounded capacity of zero is requested.
    pub fn new(name: &'static str, capacity: QueueCapacity) -> Self {
        let slots = match capacity {
            QueueCapacity::Unbounded => None,
            QueueCapacity::Bounded { capacity, overflow } => {
                assert!(capacity > 0, "Bounded queue capacity must be greater than 0");
                (overflow == OverflowPolicy::Block).then(|| Semaphore::new(capacity))
            }
        };

        Self {
            name,
            items: SegQueue::new(),
            len: AtomicUsize::new(0),
            capacity,
            readable: Notify::new(),
            slots,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create an unbounded queue
    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, QueueCapacity::Unbounded)
    }

    /// Queue name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue an item.
    ///
    /// Completes immediately unless the queue is bounded with
    /// [`OverflowPolicy::Block`] and full, in which case it waits for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::QueueClosed`] if the queue is closed.
    pub async fn push(&self, item: T) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::QueueClosed);
        }

        if let Some(slots) = &self.slots {
            let permit = slots
                .acquire()
                .await
                .map_err(|_| TransportError::QueueClosed)?;
            permit.forget();
        }

        self.enqueue(item);
        Ok(())
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is closed, or full under
    /// [`OverflowPolicy::Block`].
    pub fn try_push(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }

        if let Some(slots) = &self.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(item),
            }
        }

        self.enqueue(item);
        Ok(())
    }

    fn enqueue(&self, item: T) {
        // Count before publishing so a racing consumer never underflows `len`.
        self.len.fetch_add(1, Ordering::AcqRel);
        self.items.push(item);

        if let QueueCapacity::Bounded {
            capacity,
            overflow: OverflowPolicy::DropOldest,
        } = self.capacity
        {
            while self.len.load(Ordering::Acquire) > capacity {
                if self.items.pop().is_none() {
                    break;
                }
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.readable.notify_one();
    }

    /// Dequeue the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        Some(item)
    }

    /// Dequeue the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Close the queue, waking every waiting producer and consumer.
    ///
    /// Items already queued can still be drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(slots) = &self.slots {
                slots.close();
            }
            self.readable.notify_waiters();
            tracing::debug!(queue = self.name, remaining = self.len(), "Queue closed");
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted under [`OverflowPolicy::DropOldest`]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured capacity policy
    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }
}

impl<T> std::fmt::Debug for PacketQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
