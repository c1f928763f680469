use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Confirmation payload handed to the external email/QR service. The
/// service resolves recipient and rendering from the ticket id.
#[derive(Debug, Clone, Serialize)]
pub struct TicketNotification {
    pub ticket_id: Uuid,
    pub qr_token: Uuid,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),

    #[error("notification service returned {0}")]
    Rejected(u16),
}

/// Fire-and-forget collaborator invoked at most once per purchased ticket.
/// Failures are the dispatcher's problem; they never reach payment state.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, notification: &TicketNotification) -> Result<(), NotifyError>;
}

/// POSTs the confirmation to the configured notifier service.
pub struct HttpNotifier {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { http, endpoint }
    }
}

#[async_trait]
impl NotificationDispatcher for HttpNotifier {
    async fn send(&self, notification: &TicketNotification) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.status().as_u16()))
        }
    }
}

/// Used when no notifier endpoint is configured; confirmations are only
/// logged.
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn send(&self, notification: &TicketNotification) -> Result<(), NotifyError> {
        info!(
            ticket_id = %notification.ticket_id,
            "No notifier configured, skipping confirmation send"
        );
        Ok(())
    }
}

/// Wraps a dispatcher with a small bounded retry (the dispatcher's own
/// policy; the reconciliation engine never retries notifications).
pub struct RetryingDispatcher<D> {
    inner: D,
    attempts: u32,
    base_delay: Duration,
}

impl<D> RetryingDispatcher<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            attempts: 2,
            base_delay: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

#[async_trait]
impl<D: NotificationDispatcher> NotificationDispatcher for RetryingDispatcher<D> {
    async fn send(&self, notification: &TicketNotification) -> Result<(), NotifyError> {
        let mut attempt = 1;
        loop {
            match self.inner.send(notification).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        ticket_id = %notification.ticket_id,
                        attempt,
                        error = %e,
                        "Notification attempt failed, retrying"
                    );
                    tokio::time::sleep(self.base_delay * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
