//! Delivery workers.
//!
//! Each worker loops on the shared [`DeliveryQueue`]: claim a notification,
//! dispatch it, then either settle it or hand it to the timer for a retry.
//! Workers stop once the shutdown token fires; an in-flight dispatch is
//! allowed to finish first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::time::Clock;
use herald_common::types::Notification;

use crate::dispatcher::DispatcherRegistry;
use crate::error::NotifyError;
use crate::queue::{Claim, DeliveryQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::stats::{DeliveryListener, StatsRecorder};
use crate::timer::DeferredQueue;

/// Everything a worker shares with its siblings.
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub queue: Arc<DeliveryQueue>,
    pub deferred: Arc<DeferredQueue>,
    pub dispatchers: Arc<DispatcherRegistry>,
    pub retry: RetryPolicy,
    pub stats: Arc<StatsRecorder>,
    pub listener: Arc<dyn DeliveryListener>,
    pub clock: Arc<dyn Clock>,
    pub token: CancellationToken,
}

/// A single queue consumer.
#[derive(Debug)]
pub struct DeliveryWorker {
    id: usize,
    ctx: WorkerContext,
}

impl DeliveryWorker {
    pub(crate) fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self) {
        while let Some(claim) = self.ctx.queue.next(&self.ctx.token).await {
            match claim {
                Claim::Ready(notification) => self.process(notification).await,
                Claim::Withdrawn(mut notification) => {
                    notification.mark_cancelled(self.ctx.clock.now());
                    tracing::debug!(
                        worker_id = self.id,
                        notification_id = %notification.id,
                        "Skipping withdrawn notification"
                    );
                    self.settle(&notification).await;
                }
            }
        }
    }

    async fn process(&self, mut notification: Notification) {
        self.ctx.stats.attempt();
        let result = self.ctx.dispatchers.dispatch(&notification).await;
        let now = self.ctx.clock.now();

        match result {
            Ok(delivery) => {
                notification.mark_sent(now, delivery.is_confirmed());
                tracing::debug!(
                    worker_id = self.id,
                    notification_id = %notification.id,
                    channel = %notification.kind,
                    status = %notification.status,
                    "Notification dispatched"
                );
                self.settle(&notification).await;
            }
            Err(error) => match self.ctx.retry.on_failure(&mut notification, &error, now) {
                RetryDecision::Retry { at } => {
                    let due = notification.defer_until(at, now);
                    tracing::info!(
                        worker_id = self.id,
                        notification_id = %notification.id,
                        retry_count = notification.retry_count,
                        max_retries = notification.max_retries,
                        retry_at = %due,
                        error = %error,
                        "Dispatch failed, retry scheduled"
                    );
                    match self.ctx.deferred.schedule(notification, due) {
                        Ok(()) => self.ctx.stats.retried(),
                        Err(err) => {
                            tracing::warn!(
                                worker_id = self.id,
                                error = %err,
                                "Retry dropped during shutdown"
                            );
                            self.ctx.stats.abandoned(1);
                        }
                    }
                }
                RetryDecision::GiveUp { reason } => {
                    tracing::debug!(
                        worker_id = self.id,
                        notification_id = %notification.id,
                        reason = %reason,
                        "Giving up on notification"
                    );
                    self.settle(&notification).await;
                }
            },
        }
    }

    async fn settle(&self, notification: &Notification) {
        self.ctx.stats.settled(notification);
        self.ctx.listener.on_settled(notification).await;
    }
}

/// Owns the spawned worker tasks.
#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(count: usize, ctx: &WorkerContext) -> Self {
        tracing::info!(worker_count = count, "Spawning delivery workers");

        let handles = (0..count)
            .map(|worker_id| {
                let worker = DeliveryWorker::new(worker_id, ctx.clone());
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "Delivery worker starting");
                    worker.run().await;
                    tracing::debug!(worker_id, "Delivery worker stopped");
                })
            })
            .collect();

        Self { handles }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Workers still running after `timeout`
    /// are aborted.
    ///
    /// The caller must have cancelled the shared token beforehand.
    pub(crate) async fn join(self, timeout: Duration) -> Result<(), NotifyError> {
        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();

        let joined = tokio::time::timeout(timeout, async {
            for (worker_id, handle) in self.handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    tracing::error!(
                        worker_id,
                        error = %join_error,
                        "Delivery worker panicked"
                    );
                }
            }
        })
        .await;

        match joined {
            Ok(()) => Ok(()),
            Err(_elapsed) => {
                tracing::error!(
                    timeout_seconds = timeout.as_secs(),
                    "Delivery workers did not stop in time, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
                Err(NotifyError::ShutdownTimeout { timeout })
            }
        }
    }
}
