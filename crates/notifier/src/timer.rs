//! Deferred delivery: a min-heap of notifications keyed by due time.
//!
//! One timer task services the heap for the whole service. It sleeps until
//! the earliest entry is due (or a new entry arrives, or shutdown fires) and
//! then moves due entries onto the [`DeliveryQueue`]. Both
//! `schedule_notification` and retry backoffs go through here, so cancelling
//! the shared token stops every pending deferred send at once.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::time::Clock;
use herald_common::types::Notification;

use crate::error::NotifyError;
use crate::queue::{DeliveryQueue, EnqueueError};

/// Longest the timer sleeps before re-reading the clock.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(1);

/// Delay before a due entry is retried when the delivery queue is full.
const FULL_QUEUE_REARM_MS: i64 = 250;

#[derive(Debug)]
struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    notification: Notification,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Debug, Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    closed: bool,
}

impl Heap {
    fn push(&mut self, notification: Notification, due: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Reverse(Entry {
            due,
            seq,
            notification,
        }));
    }
}

/// Cancellable timer queue for deferred notifications.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    heap: Mutex<Heap>,
    wake: Notify,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `notification` until `due`.
    pub fn schedule(&self, notification: Notification, due: DateTime<Utc>) -> Result<(), NotifyError> {
        {
            let mut heap = self.heap();
            if heap.closed {
                return Err(NotifyError::ShuttingDown);
            }
            heap.push(notification, due);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a pending entry, handing it back.
    pub fn withdraw(&self, id: Uuid) -> Option<Notification> {
        let mut heap = self.heap();
        let mut entries = std::mem::take(&mut heap.entries).into_vec();
        let position = entries
            .iter()
            .position(|Reverse(entry)| entry.notification.id == id);
        let removed = position.map(|index| entries.swap_remove(index).0.notification);
        heap.entries = BinaryHeap::from(entries);
        removed
    }

    /// Pop every entry due at or before `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut heap = self.heap();
        let mut due = Vec::new();
        while heap
            .entries
            .peek()
            .is_some_and(|Reverse(entry)| entry.due <= now)
        {
            if let Some(Reverse(entry)) = heap.entries.pop() {
                due.push(entry.notification);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap().entries.peek().map(|Reverse(entry)| entry.due)
    }

    pub fn len(&self) -> usize {
        self.heap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending notifications ordered by due time.
    pub fn snapshot(&self) -> Vec<(DateTime<Utc>, Notification)> {
        let heap = self.heap();
        let mut items: Vec<_> = heap
            .entries
            .iter()
            .map(|Reverse(entry)| (entry.due, entry.seq, entry.notification.clone()))
            .collect();
        items.sort_by_key(|(due, seq, _)| (*due, *seq));
        items.into_iter().map(|(due, _, n)| (due, n)).collect()
    }

    /// Refuse further entries and return everything still pending.
    pub fn close(&self) -> Vec<Notification> {
        let mut heap = self.heap();
        heap.closed = true;
        std::mem::take(&mut heap.entries)
            .into_vec()
            .into_iter()
            .map(|Reverse(entry)| entry.notification)
            .collect()
    }

    /// Timer loop: move due entries onto `queue` until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!("Deferred delivery timer started");

        loop {
            let now = clock.now();
            for notification in self.take_due(now) {
                self.release(&queue, notification, now);
            }

            let wait = match self.next_due() {
                Some(due) => (due - clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_TIMER_SLEEP),
                None => MAX_TIMER_SLEEP,
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(pending = self.len(), "Deferred delivery timer stopped");
    }

    fn release(&self, queue: &DeliveryQueue, notification: Notification, now: DateTime<Utc>) {
        let id = notification.id;
        match queue.try_enqueue(notification) {
            Ok(()) => {
                tracing::debug!(notification_id = %id, "Deferred notification released");
            }
            Err(EnqueueError::Full(notification)) => {
                tracing::warn!(
                    notification_id = %id,
                    "Delivery queue full, re-arming deferred notification"
                );
                self.heap().push(
                    notification,
                    now + chrono::Duration::milliseconds(FULL_QUEUE_REARM_MS),
                );
            }
            Err(EnqueueError::Closed(_)) => {
                tracing::warn!(
                    notification_id = %id,
                    "Delivery queue closed, dropping deferred notification"
                );
            }
        }
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
