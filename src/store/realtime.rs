//! Outbox change-feed over the store's realtime websocket.
//!
//! Each inserted outbox row becomes one awaited send in its own detached
//! task, followed by a status update on the row. The feed only joins after
//! the session first reports `Connected`.

use super::StoreClient;
use crate::dispatch::{DispatchError, OutboundDispatcher, OutboundRequest};
use crate::session::SessionState;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const HEARTBEAT_SECS: u64 = 30;
const CHANNEL_TOPIC: &str = "realtime:outbox-listener";

/// An inserted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub id: Value,
    pub to_number: String,
    pub reply_body: String,
}

/// `https://x.supabase.co` -> `wss://x.supabase.co/realtime/v1/websocket?apikey=..&vsn=1.0.0`
pub fn realtime_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!(
        "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        urlencoding::encode(api_key)
    )
}

pub fn join_frame(schema: &str, table: &str, api_key: &str) -> Value {
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": schema, "table": table }
                ]
            },
            "access_token": api_key
        },
        "ref": "1",
        "join_ref": "1"
    })
}

pub fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string()
    })
}

/// Extract an INSERT record from a `postgres_changes` frame.
pub fn parse_outbox_insert(frame: &Value) -> Option<OutboxRow> {
    if frame.get("event")?.as_str()? != "postgres_changes" {
        return None;
    }
    let data = frame.get("payload")?.get("data")?;
    if data.get("type")?.as_str()? != "INSERT" {
        return None;
    }
    let record = data.get("record")?;
    Some(OutboxRow {
        id: record.get("id")?.clone(),
        to_number: record.get("to_number")?.as_str()?.to_string(),
        reply_body: record.get("reply_body")?.as_str()?.to_string(),
    })
}

/// `phx_reply` carrying `status: error` for our join.
fn join_rejected(frame: &Value) -> Option<String> {
    if frame.get("event")?.as_str()? != "phx_reply" || frame.get("ref")?.as_str()? != "1" {
        return None;
    }
    let payload = frame.get("payload")?;
    if payload.get("status")?.as_str()? == "error" {
        Some(payload.get("response").map_or_else(String::new, Value::to_string))
    } else {
        None
    }
}

pub struct OutboxListener {
    store: Arc<StoreClient>,
    state: Arc<SessionState>,
    dispatcher: Arc<OutboundDispatcher>,
}

impl OutboxListener {
    pub fn new(
        store: Arc<StoreClient>,
        state: Arc<SessionState>,
        dispatcher: Arc<OutboundDispatcher>,
    ) -> Self {
        Self {
            store,
            state,
            dispatcher,
        }
    }

    async fn wait_until_connected(&self) -> Result<()> {
        let mut changes = self.state.subscribe();
        loop {
            if changes.borrow_and_update().is_connected() {
                return Ok(());
            }
            changes
                .changed()
                .await
                .context("Session state channel closed")?;
        }
    }

    /// Runs until the feed drops; the caller restarts it.
    pub async fn run(&self) -> Result<()> {
        self.wait_until_connected().await?;

        let url = realtime_url(self.store.base_url(), self.store.api_key());
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("Failed to connect to realtime websocket")?;
        let (mut write, mut read) = socket.split();

        let join = join_frame(
            self.store.schema(),
            self.store.outbox_table(),
            self.store.api_key(),
        );
        write
            .send(Message::Text(join.to_string().into()))
            .await
            .context("Failed to send realtime join")?;
        tracing::info!(
            table = self.store.outbox_table(),
            "Subscribed to outbox inserts"
        );
        crate::health::report_ok("outbox");

        let period = Duration::from_secs(HEARTBEAT_SECS);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut reference: u64 = 1;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    reference += 1;
                    write
                        .send(Message::Text(heartbeat_frame(reference).to_string().into()))
                        .await
                        .context("Failed to send realtime heartbeat")?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.on_frame(text.as_str())?,
                        Some(Ok(Message::Close(close))) => {
                            anyhow::bail!("Realtime websocket closed: {close:?}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("Realtime websocket error"),
                        None => anyhow::bail!("Realtime websocket stream ended"),
                    }
                }
            }
        }
    }

    fn on_frame(&self, text: &str) -> Result<()> {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Ignoring non-JSON realtime frame: {e}");
                return Ok(());
            }
        };
        if let Some(reason) = join_rejected(&frame) {
            anyhow::bail!("Realtime join rejected: {reason}");
        }
        if let Some(row) = parse_outbox_insert(&frame) {
            let store = self.store.clone();
            let state = self.state.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { process_row(&store, &state, &dispatcher, row).await });
        }
        Ok(())
    }
}

/// Send one outbox row and record the outcome on it.
pub async fn process_row(
    store: &StoreClient,
    state: &SessionState,
    dispatcher: &OutboundDispatcher,
    row: OutboxRow,
) {
    if !state.connectivity().is_connected() {
        tracing::error!(row = %row.id, "Outbox row received while WhatsApp is not connected");
        return;
    }

    let request = OutboundRequest {
        destination: row.to_number.clone(),
        text: row.reply_body.clone(),
    };
    let status = match dispatcher.send_awaited(request).await {
        Ok(message_id) => {
            tracing::info!(row = %row.id, %message_id, "Outbox reply sent");
            "sent".to_string()
        }
        Err(DispatchError::NotConnected) => {
            tracing::error!(row = %row.id, "Outbox row dropped: WhatsApp disconnected mid-send");
            return;
        }
        Err(DispatchError::SendFailed(message)) => {
            tracing::error!(row = %row.id, "Outbox reply failed: {message}");
            format!("error: {message}")
        }
        Err(e) => {
            tracing::error!(row = %row.id, "Outbox reply rejected: {e}");
            format!("error: {e}")
        }
    };

    if let Err(e) = store.update_outbox_status(&row.id, &status).await {
        tracing::error!(row = %row.id, "Failed to update outbox status: {e:#}");
    }
}
