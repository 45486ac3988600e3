//! Outbound event publication.
//!
//! Publishes are fire-and-forget: bounded latency, no retry. A lost event
//! must never block or duplicate a business transition, so callers log
//! failures and move on.

use async_trait::async_trait;

pub const PUBLISH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// POSTs `{topic, payload}` to a webhook endpoint.
pub struct WebhookBus {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookBus {
    pub fn new(endpoint: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(PUBLISH_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl EventBus for WebhookBus {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "topic": topic, "payload": payload }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Swallows everything. Used when no bus endpoint is configured, and in
/// tests that do not observe events.
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, _topic: &str, _payload: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}
