//! Forwards inbound events to an external automation endpoint.

use super::{InboundConsumer, InboundEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// Upstream reply captured for diagnostics.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub status: u16,
    pub body: Value,
}

pub struct WebhookForwarder {
    url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl WebhookForwarder {
    pub fn new(url: String, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url,
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn payload(event: &InboundEvent) -> Value {
        let mut body = json!({
            "from": event.sender_address,
            "text": event.text,
            "timestamp": event.timestamp,
            "messageId": event.message_id,
        });
        if let Some(name) = &event.sender_name {
            body["senderName"] = json!(name);
        }
        body
    }

    pub async fn forward(&self, event: &InboundEvent) -> Result<()> {
        self.forward_value(&Self::payload(event)).await.map(|_| ())
    }

    /// POST `body` and return the upstream reply; non-2xx is an error.
    pub async fn forward_value(&self, body: &Value) -> Result<WebhookReply> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Webhook returned {status}: {text}");
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(WebhookReply {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl InboundConsumer for WebhookForwarder {
    fn name(&self) -> &str {
        "webhook"
    }

    fn sequential(&self) -> bool {
        false
    }

    async fn consume(&self, event: &InboundEvent) -> Result<()> {
        self.forward(event).await
    }
}
