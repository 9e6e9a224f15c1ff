//! Asynchronous notification delivery engine.
//!
//! Producers hand [`Notification`](herald_common::types::Notification)s to the
//! [`NotificationService`](service::NotificationService), which places them on a
//! bounded [`DeliveryQueue`](queue::DeliveryQueue) drained by a pool of
//! [`DeliveryWorker`](worker::DeliveryWorker)s:
//!
//! - dispatch goes through a per-channel [`Dispatcher`](dispatcher::Dispatcher)
//! - failures are retried after a [`BackoffStrategy`](retry::BackoffStrategy) delay
//! - deferred sends and retry backoffs wait in a cancellable timer heap
//!   ([`DeferredQueue`](timer::DeferredQueue))
//!
//! The queue is in-memory and best-effort: anything still queued at shutdown
//! is dropped and counted as abandoned.

pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod queue;
pub mod retry;
pub mod senders;
pub mod service;
pub mod stats;
pub mod timer;
pub mod worker;

pub use dispatcher::{Delivery, Dispatcher, DispatcherRegistry};
pub use error::{DispatchError, NotifyError};
pub use service::{NotificationService, NotifierConfig, QueueStatus};
pub use stats::{DeliveryListener, DeliveryStats};
