//! Bounded multi-producer / multi-consumer delivery queue.
//!
//! A tokio `mpsc` channel whose receiver is shared behind an async mutex, so
//! any number of workers can wait on it. Enqueue is always non-blocking.
//!
//! Withdrawals cannot pull an item out of the channel, so the queue tracks
//! which ids are waiting inside it and marks withdrawn ones; the worker that
//! eventually dequeues such an item gets [`Claim::Withdrawn`] instead of
//! dispatching it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::types::Notification;

/// Why an enqueue was refused. Hands the notification back to the caller.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Notification),
    Closed(Notification),
}

/// An item taken off the queue by a worker.
#[derive(Debug)]
pub enum Claim {
    /// Dispatch it.
    Ready(Notification),
    /// Withdrawn while queued; settle it as cancelled.
    Withdrawn(Notification),
}

#[derive(Debug, Default)]
struct Membership {
    queued: HashSet<Uuid>,
    withdrawn: HashSet<Uuid>,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    sender: mpsc::Sender<Notification>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Notification>>>,
    membership: Mutex<Membership>,
}

impl DeliveryQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            membership: Mutex::new(Membership::default()),
        }
    }

    /// Enqueue without waiting. Fails immediately when full or closed.
    pub fn try_enqueue(&self, notification: Notification) -> Result<(), EnqueueError> {
        let id = notification.id;
        // Register before sending so a fast worker always finds the entry.
        self.membership().queued.insert(id);

        match self.sender.try_send(notification) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut membership = self.membership();
                membership.queued.remove(&id);
                membership.withdrawn.remove(&id);
                drop(membership);
                Err(match err {
                    TrySendError::Full(n) => EnqueueError::Full(n),
                    TrySendError::Closed(n) => EnqueueError::Closed(n),
                })
            }
        }
    }

    /// Wait for the next item, or `None` once `shutdown` fires or the queue
    /// is closed.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<Claim> {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            item = async { self.receiver.lock().await.recv().await } => item,
        }?;

        let mut membership = self.membership();
        membership.queued.remove(&received.id);
        if membership.withdrawn.remove(&received.id) {
            Some(Claim::Withdrawn(received))
        } else {
            Some(Claim::Ready(received))
        }
    }

    /// Mark a queued notification as withdrawn. Returns `false` if it is not
    /// (or no longer) waiting in the queue.
    pub fn withdraw(&self, id: Uuid) -> bool {
        let mut membership = self.membership();
        if membership.queued.contains(&id) {
            membership.withdrawn.insert(id);
            true
        } else {
            false
        }
    }

    /// Close the queue and drain whatever is still inside.
    ///
    /// After this every [`try_enqueue`](Self::try_enqueue) fails with
    /// [`EnqueueError::Closed`]. Safe to call more than once.
    pub async fn close(&self) -> Vec<Notification> {
        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut leftover = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            leftover.push(notification);
        }

        let mut membership = self.membership();
        membership.queued.clear();
        membership.withdrawn.clear();
        leftover
    }

    /// Number of notifications currently waiting.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn membership(&self) -> std::sync::MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
