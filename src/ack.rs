//! At-least-once delivery bookkeeping
//!
//! Records every delivery that carries an acknowledgement obligation and
//! releases the entry once the broker ack goes out. Entries left over from
//! an earlier connection epoch are retired on reconnect; the broker
//! redelivers anything that was never confirmed, so retired tags reappear
//! under the new epoch with the `redelivered` flag set. Duplicates are the
//! handler's concern, not this tracker's.

use crate::message::{DeliveryTag, InboundMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pending acknowledgement obligations, keyed by topic
///
/// Each topic keeps its tags in delivery order, matching the per-topic FIFO
/// the dispatcher enforces. All methods take `&self`; the tracker is shared
/// between the supervisor (track, retire) and the workers (confirm).
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<Arc<str>, VecDeque<DeliveryTag>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<Arc<str>, VecDeque<DeliveryTag>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivery that must eventually be acknowledged
    ///
    /// At-most-once deliveries carry no obligation and are not recorded.
    pub fn track(&self, message: &InboundMessage) {
        if !message.qos.requires_ack() {
            return;
        }
        self.guard()
            .entry(message.topic.clone())
            .or_default()
            .push_back(message.tag);
    }

    /// Release an obligation after the broker acknowledgement succeeded
    ///
    /// Returns false if the tag was not pending, which happens when the
    /// entry was already retired by a reconnect.
    pub fn confirm(&self, topic: &str, tag: DeliveryTag) -> bool {
        self.remove(topic, tag)
    }

    /// Drop an obligation without acknowledging, for messages evicted
    /// under the drop-oldest policy
    ///
    /// The broker still holds the message as un-acked and will redeliver
    /// it on the next session resumption.
    pub fn discard(&self, topic: &str, tag: DeliveryTag) -> bool {
        self.remove(topic, tag)
    }

    fn remove(&self, topic: &str, tag: DeliveryTag) -> bool {
        let mut pending = self.guard();
        let Some(queue) = pending.get_mut(topic) else {
            return false;
        };
        let Some(position) = queue.iter().position(|entry| *entry == tag) else {
            return false;
        };
        queue.remove(position);
        if queue.is_empty() {
            pending.remove(topic);
        }
        true
    }

    /// Snapshot of all unacknowledged tags, oldest first
    pub fn pending(&self) -> Vec<DeliveryTag> {
        let mut tags: Vec<DeliveryTag> = self
            .guard()
            .values()
            .flat_map(|queue| queue.iter().copied())
            .collect();
        tags.sort();
        tags
    }

    pub fn pending_count(&self) -> usize {
        self.guard().values().map(VecDeque::len).sum()
    }

    /// Retire obligations from epochs before `epoch` and return them
    ///
    /// Called by the supervisor after every reconnect. The returned tags
    /// identify deliveries the broker is expected to redeliver under the
    /// new epoch.
    pub fn begin_epoch(&self, epoch: u32) -> Vec<DeliveryTag> {
        let mut retired = Vec::new();
        let mut pending = self.guard();
        pending.retain(|_, queue| {
            queue.retain(|tag| {
                if tag.epoch < epoch {
                    retired.push(*tag);
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        drop(pending);
        retired.sort();
        retired
    }
}
