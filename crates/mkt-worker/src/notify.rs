//! Best-effort outbound notifications.

use std::time::Duration;

use async_trait::async_trait;
use mkt_storage::{HttpClientConfig, HttpFetcher};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivery never fails from the caller's point of view.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run_id: Uuid, text: &str);
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _run_id: Uuid, text: &str) {
        debug!(text, "no webhook configured; notification dropped");
    }
}

/// Posts `{"text": ...}` to a chat-style incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http: HttpFetcher,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, user_agent: &str) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: WEBHOOK_TIMEOUT,
            user_agent: Some(user_agent.to_string()),
        })?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, run_id: Uuid, text: &str) {
        let body = json!({ "text": text });
        if let Err(err) = self.http.post_json(run_id, "webhook", &self.url, &body).await {
            warn!(error = %err, "webhook delivery failed");
        }
    }
}

/// Webhook notifier when a destination is set, otherwise a no-op.
pub fn notifier_for(webhook_url: Option<&str>, user_agent: &str) -> anyhow::Result<Box<dyn Notifier>> {
    Ok(match webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url, user_agent)?),
        None => Box::new(NoopNotifier),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_completes() {
        NoopNotifier.notify(Uuid::new_v4(), "hello").await;
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        // Port 9 (discard) on localhost is closed in test environments.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", "test-agent").unwrap();
        notifier.notify(Uuid::new_v4(), "net flow alert").await;
    }

    #[test]
    fn notifier_selection_follows_destination() {
        assert!(notifier_for(None, "ua").is_ok());
        assert!(notifier_for(Some("https://hooks.example.test/x"), "ua").is_ok());
    }
}
