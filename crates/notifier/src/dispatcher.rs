//! Dispatcher contract and channel → sender table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use herald_common::types::{Notification, NotificationType};

use crate::error::DispatchError;

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the channel; final delivery is not observable.
    Accepted,
    /// The channel confirmed delivery synchronously.
    Confirmed,
}

impl Delivery {
    pub fn is_confirmed(self) -> bool {
        matches!(self, Delivery::Confirmed)
    }
}

/// Sends one notification over one channel.
///
/// Implementations must not mutate shared state in a way that assumes a single
/// caller: several workers invoke the same dispatcher concurrently.
#[async_trait]
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError>;
}

/// Lookup table from channel type to its registered sender.
#[derive(Debug, Clone, Default)]
pub struct DispatcherRegistry {
    senders: HashMap<NotificationType, Arc<dyn Dispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dispatcher` for `kind`, returning the sender it replaced.
    pub fn register(
        &mut self,
        kind: NotificationType,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Option<Arc<dyn Dispatcher>> {
        self.senders.insert(kind, dispatcher)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: NotificationType, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.register(kind, dispatcher);
        self
    }

    /// Register the same sender for every channel type.
    pub fn with_all(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        for kind in NotificationType::ALL {
            self.register(kind, dispatcher.clone());
        }
        self
    }

    pub fn resolve(&self, kind: NotificationType) -> Option<Arc<dyn Dispatcher>> {
        self.senders.get(&kind).cloned()
    }

    /// Resolve and invoke the sender for the notification's channel.
    pub async fn dispatch(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        match self.resolve(notification.kind) {
            Some(dispatcher) => dispatcher.send(notification).await,
            None => Err(DispatchError::Unsupported(notification.kind)),
        }
    }

    pub fn channels(&self) -> Vec<NotificationType> {
        NotificationType::ALL
            .into_iter()
            .filter(|kind| self.senders.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use herald_common::types::{Priority, Trigger};

    use super::*;

    #[derive(Debug)]
    struct Fixed(Result<Delivery, DispatchError>);

    #[async_trait]
    impl Dispatcher for Fixed {
        async fn send(&self, _notification: &Notification) -> Result<Delivery, DispatchError> {
            self.0.clone()
        }
    }

    fn make_notification(kind: NotificationType) -> Notification {
        Notification::new(1, 1, kind, Priority::Normal, Trigger::Custom, "t", "m")
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let registry = DispatcherRegistry::new()
            .with(NotificationType::InApp, Arc::new(Fixed(Ok(Delivery::Confirmed))))
            .with(
                NotificationType::Email,
                Arc::new(Fixed(Err(DispatchError::transient("smtp down")))),
            );

        let in_app = registry
            .dispatch(&make_notification(NotificationType::InApp))
            .await;
        assert_eq!(in_app, Ok(Delivery::Confirmed));

        let email = registry
            .dispatch(&make_notification(NotificationType::Email))
            .await;
        assert_eq!(email, Err(DispatchError::transient("smtp down")));
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_unsupported() {
        let registry = DispatcherRegistry::new();
        let result = registry
            .dispatch(&make_notification(NotificationType::Sms))
            .await;
        assert_eq!(result, Err(DispatchError::Unsupported(NotificationType::Sms)));
        assert!(!result.unwrap_err().is_retryable());
    }

    #[test]
    fn test_register_replaces_and_lists_channels() {
        let mut registry =
            DispatcherRegistry::new().with_all(Arc::new(Fixed(Ok(Delivery::Accepted))));
        assert_eq!(registry.channels().len(), NotificationType::ALL.len());

        let replaced = registry.register(
            NotificationType::Slack,
            Arc::new(Fixed(Ok(Delivery::Confirmed))),
        );
        assert!(replaced.is_some());
    }
}
