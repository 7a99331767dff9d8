//! Supabase-style durable store: inbox persistence and outbox status updates
//! over the PostgREST API, plus the realtime outbox feed in [`realtime`].

pub mod realtime;

pub use realtime::{OutboxListener, OutboxRow};

use crate::config::StoreConfig;
use crate::inbound::{InboundConsumer, InboundEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 15;

pub struct StoreClient {
    base_url: String,
    api_key: String,
    schema: String,
    inbox_table: String,
    outbox_table: String,
    client: reqwest::Client,
}

impl StoreClient {
    /// `None` when url or key is missing.
    pub fn from_config(config: &StoreConfig) -> Result<Option<Self>> {
        let Some((url, key)) = config.credentials() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build store HTTP client")?;
        Ok(Some(Self {
            base_url: url.trim_end_matches('/').to_string(),
            api_key: key.to_string(),
            schema: config.schema.clone(),
            inbox_table: config.inbox_table.clone(),
            outbox_table: config.outbox_table.clone(),
            client,
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn outbox_table(&self) -> &str {
        &self.outbox_table
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=minimal")
    }

    pub async fn insert_inbox(&self, event: &InboundEvent) -> Result<()> {
        let row = json!({
            "from_number": event.sender_address,
            "text_body": event.text,
            "sender_name": event.sender_name.as_deref().unwrap_or("Unknown"),
        });
        let response = self
            .request(reqwest::Method::POST, self.table_url(&self.inbox_table))
            .json(&row)
            .send()
            .await
            .context("Inbox insert request failed")?;
        ensure_success(response, "inbox insert").await
    }

    pub async fn update_outbox_status(&self, id: &serde_json::Value, status: &str) -> Result<()> {
        let id = match id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let url = format!(
            "{}?id=eq.{}",
            self.table_url(&self.outbox_table),
            urlencoding::encode(&id)
        );
        let response = self
            .request(reqwest::Method::PATCH, url)
            .json(&json!({ "status": status }))
            .send()
            .await
            .context("Outbox status update request failed")?;
        ensure_success(response, "outbox status update").await
    }
}

async fn ensure_success(response: reqwest::Response, what: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("Store {what} returned {status}: {body}")
}

/// Appends each inbound event to the inbox table.
pub struct InboxSink {
    store: Arc<StoreClient>,
}

impl InboxSink {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InboundConsumer for InboxSink {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn consume(&self, event: &InboundEvent) -> Result<()> {
        self.store.insert_inbox(event).await
    }
}
