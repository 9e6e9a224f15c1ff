//! Reference dispatchers.
//!
//! - [`InAppSender`]: per-user in-memory inbox, confirms delivery
//! - [`WebhookSender`]: JSON POST for generic webhooks, Slack and Discord
//! - [`LogSender`]: logs the notification and reports it accepted

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use herald_common::types::Notification;

use crate::dispatcher::{Delivery, Dispatcher};
use crate::error::DispatchError;

/// Notifications kept per user before the oldest are dropped.
const INBOX_LIMIT: usize = 100;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory in-app inbox.
#[derive(Debug, Default)]
pub struct InAppSender {
    inboxes: Mutex<HashMap<i64, Vec<Notification>>>,
}

impl InAppSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest-last copy of a user's inbox.
    pub fn inbox(&self, user_id: i64) -> Vec<Notification> {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for InAppSender {
    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        let mut inboxes = self.inboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let inbox = inboxes.entry(notification.user_id).or_default();
        inbox.push(notification.clone());
        if inbox.len() > INBOX_LIMIT {
            let excess = inbox.len() - INBOX_LIMIT;
            inbox.drain(..excess);
        }
        Ok(Delivery::Confirmed)
    }
}

/// Body shape expected by the receiving endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    /// The whole notification as JSON.
    Generic,
    /// Slack incoming webhook: `{"text": ...}`.
    Slack,
    /// Discord webhook: `{"content": ...}`.
    Discord,
}

impl WebhookFormat {
    pub fn payload(self, notification: &Notification) -> serde_json::Value {
        match self {
            WebhookFormat::Generic => json!(notification),
            WebhookFormat::Slack => json!({
                "text": format!("*{}*\n{}", notification.title, notification.message),
            }),
            WebhookFormat::Discord => json!({
                "content": format!("**{}**\n{}", notification.title, notification.message),
            }),
        }
    }
}

/// POSTs notifications to an HTTP endpoint.
///
/// The notification's `recipient`, when set, overrides the configured URL.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    format: WebhookFormat,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, format: WebhookFormat) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            format,
        })
    }
}

#[async_trait]
impl Dispatcher for WebhookSender {
    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        let url = notification.recipient.as_deref().unwrap_or(&self.url);

        let response = self
            .client
            .post(url)
            .json(&self.format.payload(notification))
            .send()
            .await
            .map_err(|err| DispatchError::transient(format!("webhook request failed: {err}")))?;

        classify_status(response.status())
    }
}

/// Map an HTTP status to a dispatch outcome.
///
/// 2xx is accepted; 5xx, 408 and 429 are worth retrying; any other status
/// will not get better on its own.
pub fn classify_status(status: StatusCode) -> Result<Delivery, DispatchError> {
    if status.is_success() {
        Ok(Delivery::Accepted)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(DispatchError::transient(format!("webhook returned {status}")))
    } else {
        Err(DispatchError::permanent(format!("webhook returned {status}")))
    }
}

/// Channel placeholder that only logs.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl Dispatcher for LogSender {
    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        tracing::info!(
            notification_id = %notification.id,
            user_id = notification.user_id,
            channel = %notification.kind,
            recipient = notification.recipient.as_deref().unwrap_or_default(),
            title = %notification.title,
            "Notification logged"
        );
        Ok(Delivery::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use herald_common::types::{NotificationType, Priority, Trigger};

    use super::*;

    fn make_notification(user_id: i64) -> Notification {
        Notification::new(
            user_id,
            9,
            NotificationType::Slack,
            Priority::High,
            Trigger::Overdue,
            "Overdue Task: Taxes",
            "Your task 'Taxes' is 2 hours overdue.",
        )
    }

    #[test]
    fn test_chat_payloads() {
        let n = make_notification(1);
        assert_eq!(
            WebhookFormat::Slack.payload(&n),
            json!({"text": "*Overdue Task: Taxes*\nYour task 'Taxes' is 2 hours overdue."})
        );
        assert_eq!(
            WebhookFormat::Discord.payload(&n)["content"],
            "**Overdue Task: Taxes**\nYour task 'Taxes' is 2 hours overdue."
        );
    }

    #[test]
    fn test_generic_payload_is_the_notification() {
        let n = make_notification(1);
        let payload = WebhookFormat::Generic.payload(&n);
        assert_eq!(payload["id"], n.id.to_string());
        assert_eq!(payload["type"], "slack");
        assert_eq!(payload["trigger"], "overdue");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::NO_CONTENT), Ok(Delivery::Accepted));
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap_err().is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND).unwrap_err().is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED).unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_in_app_inbox_is_per_user_and_capped() {
        let sender = InAppSender::new();
        for _ in 0..INBOX_LIMIT + 5 {
            assert_eq!(sender.send(&make_notification(1)).await, Ok(Delivery::Confirmed));
        }
        sender.send(&make_notification(2)).await.unwrap();

        assert_eq!(sender.inbox(1).len(), INBOX_LIMIT);
        assert_eq!(sender.inbox(2).len(), 1);
        assert!(sender.inbox(3).is_empty());
    }
}
