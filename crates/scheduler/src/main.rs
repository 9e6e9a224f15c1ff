use std::sync::Arc;

use anyhow::Context;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::types::NotificationType;
use herald_notifier::senders::{InAppSender, LogSender, WebhookFormat, WebhookSender};
use herald_notifier::{DispatcherRegistry, NotificationService, NotifierConfig};
use herald_scheduler::{PgTaskRepository, Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_notifier=info,herald_scheduler=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notification daemon starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to the task store
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    let pool = db::create_pool(database_url, config.db_max_connections).await?;

    let registry = build_registry(&config)?;
    let service = Arc::new(NotificationService::new(NotifierConfig::from(&config), registry));
    service.start().await?;

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(PgTaskRepository::new(pool)),
        service.clone(),
        SchedulerConfig::from(&config),
    ));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    // Cancels the shared token, which also ends the scheduler loop
    if let Err(e) = service.stop().await {
        tracing::error!(error = %e, "Notification service did not stop cleanly");
    }
    let scheduler_abort = scheduler_handle.abort_handle();
    match tokio::time::timeout(config.shutdown_timeout(), scheduler_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Scheduler task panicked"),
        Err(_elapsed) => {
            tracing::warn!("Scheduler did not stop in time, aborting");
            scheduler_abort.abort();
        }
    }

    let stats = service.stats();
    tracing::info!(
        sent = stats.sent,
        failed = stats.failed,
        abandoned = stats.abandoned,
        scans = scheduler.status().ticks,
        "Herald notification daemon stopped."
    );
    Ok(())
}

/// In-app delivery is always on; webhook-style channels get a real sender when
/// an endpoint is configured and fall back to logging otherwise.
fn build_registry(config: &AppConfig) -> anyhow::Result<DispatcherRegistry> {
    let mut registry = DispatcherRegistry::new()
        .with_all(Arc::new(LogSender))
        .with(NotificationType::InApp, Arc::new(InAppSender::new()));

    let endpoints = [
        (NotificationType::Webhook, &config.webhook_url, WebhookFormat::Generic),
        (NotificationType::Slack, &config.slack_webhook_url, WebhookFormat::Slack),
        (NotificationType::Discord, &config.discord_webhook_url, WebhookFormat::Discord),
    ];
    for (kind, url, format) in endpoints {
        match url {
            Some(url) => {
                let sender = WebhookSender::new(url.clone(), format)
                    .with_context(|| format!("failed to build {kind} sender"))?;
                registry.register(kind, Arc::new(sender));
            }
            None => {
                tracing::warn!(channel = %kind, "No endpoint configured, notifications will only be logged");
            }
        }
    }

    for kind in [NotificationType::Email, NotificationType::Sms] {
        tracing::warn!(channel = %kind, "No transport available, notifications will only be logged");
    }

    Ok(registry)
}
