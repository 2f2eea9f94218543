//! Permanent-failure alerting.
//!
//! When a message exhausts its attempts or hits a permanent transport
//! error, the dispatcher fires a best-effort alert so an operator hears
//! about the dropped send. Alert failures are logged and swallowed; they
//! never change queue state or abort the dispatch run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Alert payload describing a permanently failed message.
#[derive(Debug, Clone, Serialize)]
pub struct FailureAlert {
    /// Queue item id.
    pub id: Uuid,
    /// Subject line of the failed message.
    pub subject: String,
    /// Summary of intended recipients, groups unexpanded.
    pub recipients: String,
    /// Attempts consumed before giving up.
    pub attempts: u32,
    /// Final error string.
    pub error: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Delivers permanent-failure alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert. Best effort; implementations log failures
    /// rather than return them.
    async fn notify_failure(&self, alert: &FailureAlert);
}

/// Notifier that POSTs the alert as JSON to a configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Build a notifier for the given webhook URL.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_failure(&self, alert: &FailureAlert) {
        match self.client.post(&self.url).json(alert).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(id = %alert.id, "failure alert delivered");
            }
            Ok(resp) => {
                tracing::warn!(
                    id = %alert.id,
                    status = %resp.status(),
                    "failure alert rejected by webhook"
                );
            }
            Err(e) => {
                tracing::warn!(id = %alert.id, error = %e, "failure alert delivery failed");
            }
        }
    }
}

#[async_trait]
impl Notifier for Box<dyn Notifier> {
    async fn notify_failure(&self, alert: &FailureAlert) {
        (**self).notify_failure(alert).await;
    }
}

/// Notifier used when no webhook is configured. Logs and discards.
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_failure(&self, alert: &FailureAlert) {
        tracing::warn!(
            id = %alert.id,
            subject = %alert.subject,
            attempts = alert.attempts,
            error = %alert.error,
            "message permanently failed (no webhook configured)"
        );
    }
}
