//! Bounded FIFO inbox between the transport and the dispatcher
//!
//! Decouples broker intake from handler execution while capping memory.
//! When full, either suspends the producer (Block) or evicts the oldest
//! queued message (DropOldest); the policy is fixed at startup.

use crate::config::{InboxSection, OverflowPolicy};
use crate::message::InboundMessage;
use crate::observability::metrics::METRICS;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// Result of offering a message to the inbox
#[derive(Debug)]
pub enum PushOutcome {
    /// The message was queued
    Stored,
    /// The message was queued and the oldest entry was evicted to make room
    Displaced(InboundMessage),
}

/// Bounded FIFO queue with a configurable overflow policy
///
/// Both `push` and `pop` are cancel safe: a message is only ever removed
/// or stored at the moment the future completes, so a caller parking one
/// of these futures inside `select!` cannot lose messages.
pub struct Inbox {
    capacity: usize,
    policy: OverflowPolicy,
    queue: Mutex<VecDeque<InboundMessage>>,
    not_empty: Notify,
    not_full: Notify,
}

impl Inbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        debug_assert!(capacity >= 1, "inbox capacity must be at least 1");
        Self {
            capacity,
            policy,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn from_config(config: &InboxSection) -> Self {
        Self::new(config.capacity, config.overflow)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Queued message count
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Offer a message, applying the overflow policy when full
    ///
    /// Under `Block` this waits for a free slot; under `DropOldest` it
    /// never waits and reports the evicted message instead.
    pub async fn push(&self, message: InboundMessage) -> PushOutcome {
        match self.policy {
            OverflowPolicy::DropOldest => {
                let mut queue = self.queue.lock().await;
                let displaced = if queue.len() == self.capacity {
                    queue.pop_front()
                } else {
                    None
                };
                queue.push_back(message);
                METRICS.inbox_depth_changed(queue.len());
                drop(queue);

                self.not_empty.notify_one();
                match displaced {
                    Some(old) => {
                        METRICS.record_message_dropped();
                        PushOutcome::Displaced(old)
                    }
                    None => PushOutcome::Stored,
                }
            }
            OverflowPolicy::Block => loop {
                {
                    let mut queue = self.queue.lock().await;
                    if queue.len() < self.capacity {
                        queue.push_back(message);
                        METRICS.inbox_depth_changed(queue.len());
                        // Pass the baton if there is still room for the
                        // next blocked producer
                        if queue.len() < self.capacity {
                            self.not_full.notify_one();
                        }
                        drop(queue);
                        self.not_empty.notify_one();
                        return PushOutcome::Stored;
                    }
                }
                // Re-check under the lock after waking; another producer
                // may have won the freed slot
                self.not_full.notified().await;
            },
        }
    }

    /// Take the oldest queued message, waiting if the inbox is empty
    pub async fn pop(&self) -> InboundMessage {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(message) = queue.pop_front() {
                    METRICS.inbox_depth_changed(queue.len());
                    // Pass the baton if more messages remain for other
                    // consumers
                    if !queue.is_empty() {
                        self.not_empty.notify_one();
                    }
                    drop(queue);
                    self.not_full.notify_one();
                    return message;
                }
            }
            self.not_empty.notified().await;
        }
    }
}
