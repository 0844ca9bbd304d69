//! Bounded single-producer / single-consumer handoff queue
//!
//! Carries [`AuditMessage`]s from the audit source to the aggregator in FIFO
//! order. What happens when the queue is full is an explicit
//! [`OverflowPolicy`]:
//!
//! - `Block`: the producer waits for the consumer, so the consumer's pacing
//!   throttles ingestion and backpressure reaches the audit subsystem
//! - `DropNewest`: the incoming message is discarded
//! - `DropOldest`: the oldest queued message is discarded
//!
//! Dropping either end closes the queue. Messages already queued are still
//! delivered to the receiver after the sender is gone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::config::OverflowPolicy;
use crate::message::AuditMessage;

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued
    Queued,
    /// The queue was full and the message was discarded
    DroppedNewest,
    /// The queue was full and its oldest message was discarded
    DroppedOldest,
}

/// The receiving side is gone; the message was not delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed(pub AuditMessage);

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<AuditMessage>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.item_ready.notify_one();
        self.space_ready.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Create a handoff queue
///
/// A capacity of zero is raised to one.
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (HandoffSender, HandoffReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        policy,
        item_ready: Notify::new(),
        space_ready: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });

    (
        HandoffSender {
            shared: shared.clone(),
        },
        HandoffReceiver { shared },
    )
}

/// Producing half; not cloneable, there is exactly one producer
#[derive(Debug)]
pub struct HandoffSender {
    shared: Arc<Shared>,
}

impl HandoffSender {
    /// Offer a message according to the overflow policy
    ///
    /// With `Block` this waits until there is room.
    pub async fn send(&self, message: AuditMessage) -> Result<SendOutcome, Closed> {
        loop {
            if self.shared.is_closed() {
                return Err(Closed(message));
            }

            {
                let mut queue = self.shared.queue.lock().await;
                if queue.len() < self.shared.capacity {
                    queue.push_back(message);
                    drop(queue);
                    self.shared.item_ready.notify_one();
                    return Ok(SendOutcome::Queued);
                }

                match self.shared.policy {
                    OverflowPolicy::Block => {}
                    OverflowPolicy::DropNewest => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(SendOutcome::DroppedNewest);
                    }
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(message);
                        drop(queue);
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        self.shared.item_ready.notify_one();
                        return Ok(SendOutcome::DroppedOldest);
                    }
                }
            }

            // A permit stored by a pop that happened before we got here
            // wakes us immediately; the loop re-checks capacity.
            self.shared.space_ready.notified().await;
        }
    }

    /// Number of messages discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Whether the receiver is gone
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for HandoffSender {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consuming half
#[derive(Debug)]
pub struct HandoffReceiver {
    shared: Arc<Shared>,
}

impl HandoffReceiver {
    /// Wait for the next message
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<AuditMessage> {
        loop {
            {
                let mut queue = self.shared.queue.lock().await;
                if let Some(message) = queue.pop_front() {
                    drop(queue);
                    self.shared.space_ready.notify_one();
                    return Some(message);
                }
            }

            if self.shared.is_closed() {
                return None;
            }

            self.shared.item_ready.notified().await;
        }
    }

    /// Number of queued messages
    pub async fn len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Whether no messages are queued
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of messages discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting messages; queued messages can still be received
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for HandoffReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
