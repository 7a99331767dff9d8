//! WhatsApp Web session engine backed by wa-rs (native Rust implementation).
//!
//! # Feature Flag
//!
//! Requires the `whatsapp-web` feature:
//! ```sh
//! cargo build --features whatsapp-web
//! ```
//!
//! The engine keeps its device keys in `<auth_dir>/session.db` and updates
//! that store itself, so it never emits `CredentialsUpdated`.

use crate::session::{Credentials, SessionConnector, SessionLink};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(feature = "whatsapp-web")]
use {
    crate::session::{DisconnectReason, RawMessage, SessionConnection, SessionEvent},
    anyhow::{Context, anyhow},
    parking_lot::Mutex,
    std::sync::Arc,
    std::sync::atomic::Ordering,
    tokio::sync::mpsc,
    wa_rs_core::types::events::Event,
};

const SESSION_DB: &str = "session.db";

pub struct WhatsAppWebConnector {
    auth_dir: PathBuf,
    /// Phone number for pair-code linking (optional)
    #[cfg_attr(not(feature = "whatsapp-web"), allow(dead_code))]
    pair_phone: Option<String>,
}

impl WhatsAppWebConnector {
    pub fn new(auth_dir: PathBuf, pair_phone: Option<String>) -> Self {
        Self {
            auth_dir,
            pair_phone,
        }
    }

    pub fn session_db(&self) -> PathBuf {
        self.auth_dir.join(SESSION_DB)
    }
}

/// Convert an already-normalized address to a wa-rs JID.
#[cfg(feature = "whatsapp-web")]
fn recipient_to_jid(recipient: &str) -> Result<wa_rs_binary::jid::Jid> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        anyhow::bail!("Recipient cannot be empty");
    }
    trimmed
        .parse::<wa_rs_binary::jid::Jid>()
        .map_err(|e| anyhow!("Invalid WhatsApp JID `{trimmed}`: {e}"))
}

#[cfg(feature = "whatsapp-web")]
struct WhatsAppWebConnection {
    client: Arc<wa_rs::Client>,
    bot_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[cfg(feature = "whatsapp-web")]
#[async_trait]
impl SessionConnection for WhatsAppWebConnection {
    async fn send_text(&self, destination: &str, text: &str) -> Result<String> {
        let to = recipient_to_jid(destination)?;
        let outgoing = wa_rs_proto::whatsapp::Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        let message_id = self.client.send_message(to, outgoing).await?;
        tracing::debug!("WhatsApp Web: sent message to {destination} (id: {message_id})");
        Ok(message_id)
    }

    async fn close(&self) {
        self.client.enable_auto_reconnect.store(false, Ordering::Relaxed);
        self.client.disconnect().await;
        if let Some(task) = self.bot_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(feature = "whatsapp-web")]
impl Drop for WhatsAppWebConnection {
    fn drop(&mut self) {
        if let Some(task) = self.bot_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(feature = "whatsapp-web")]
fn raw_message(
    msg: &wa_rs_proto::whatsapp::Message,
    info: &wa_rs_core::types::message::MessageInfo,
) -> RawMessage {
    RawMessage {
        remote_jid: info.source.chat.to_string(),
        from_me: info.source.is_from_me,
        id: info.id.clone(),
        timestamp: info.timestamp.timestamp(),
        push_name: Some(info.push_name.clone()).filter(|n| !n.is_empty()),
        conversation: msg.conversation.clone(),
        extended_text: msg
            .extended_text_message
            .as_ref()
            .and_then(|ext| ext.text.clone()),
    }
}

/// Close reason for an engine event that ends the connection.
#[cfg(feature = "whatsapp-web")]
fn close_reason(event: &Event) -> Option<DisconnectReason> {
    let reason = match event {
        Event::LoggedOut(_) => DisconnectReason::LoggedOut,
        Event::Disconnected(_) => DisconnectReason::ConnectionLost,
        Event::StreamReplaced(_) => DisconnectReason::ConnectionReplaced,
        Event::ConnectFailure(failure) if failure.reason.is_logged_out() => {
            DisconnectReason::LoggedOut
        }
        Event::ConnectFailure(failure) => u16::try_from(failure.reason.code()).map_or_else(
            |_| DisconnectReason::Other(format!("connect failure: {}", failure.message)),
            DisconnectReason::from_status_code,
        ),
        Event::StreamError(stream_error) => stream_error.code.trim().parse::<u16>().map_or_else(
            |_| DisconnectReason::Other(format!("stream error: {}", stream_error.code)),
            DisconnectReason::from_status_code,
        ),
        Event::TemporaryBan(ban) => DisconnectReason::Other(format!(
            "temporarily banned (code {}) for {}s",
            ban.code.code(),
            ban.expire.num_seconds()
        )),
        Event::ClientOutdated(_) => DisconnectReason::Other("client outdated".into()),
        _ => return None,
    };
    Some(reason)
}

/// Translate an engine event. `Connected` is resolved by the caller, which
/// needs the client to look up the account identity.
#[cfg(feature = "whatsapp-web")]
fn map_event(event: &Event) -> Option<SessionEvent> {
    if let Some(reason) = close_reason(event) {
        tracing::warn!("WhatsApp Web connection ended: {reason} ({event:?})");
        return Some(SessionEvent::ConnectionClosed { reason });
    }
    match event {
        Event::PairingQrCode { code, .. } => Some(SessionEvent::QrChallenge(code.clone())),
        Event::PairingCode { code, .. } => {
            tracing::info!("WhatsApp Web pair code received: {code}");
            tracing::info!("Link your phone by entering this code in WhatsApp > Linked Devices");
            None
        }
        Event::Message(msg, info) => {
            Some(SessionEvent::MessagesUpsert(vec![raw_message(msg, info)]))
        }
        _ => None,
    }
}

/// Phone-number JID, else the LID, of the linked account.
#[cfg(feature = "whatsapp-web")]
async fn account_identity(client: &wa_rs::Client) -> String {
    if let Some(pn) = client.get_pn().await {
        return pn.to_string();
    }
    if let Some(lid) = client.get_lid().await {
        return lid.to_string();
    }
    tracing::warn!("WhatsApp Web connected without a known account JID");
    "unknown".to_string()
}

#[cfg(feature = "whatsapp-web")]
#[async_trait]
impl SessionConnector for WhatsAppWebConnector {
    async fn connect(&self, _credentials: Option<Credentials>) -> Result<SessionLink> {
        use wa_rs::bot::Bot;
        use wa_rs::pair_code::PairCodeOptions;
        use wa_rs_sqlite_storage::SqliteStore;
        use wa_rs_tokio_transport::TokioWebSocketTransportFactory;
        use wa_rs_ureq_http::UreqHttpClient;

        tokio::fs::create_dir_all(&self.auth_dir)
            .await
            .with_context(|| format!("Failed to create auth directory {}", self.auth_dir.display()))?;
        let db_path = self.session_db();
        tracing::info!("WhatsApp Web engine starting (session: {})", db_path.display());

        let backend = Arc::new(
            SqliteStore::new(&db_path.to_string_lossy())
                .await
                .map_err(|e| anyhow!("Failed to open session store: {e}"))?,
        );

        let mut transport_factory = TokioWebSocketTransportFactory::new();
        if let Ok(ws_url) = std::env::var("WHATSAPP_WS_URL") {
            transport_factory = transport_factory.with_url(ws_url);
        }

        let (tx, rx) = mpsc::channel::<SessionEvent>(256);

        let mut builder = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(transport_factory)
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let tx = tx.clone();
                async move {
                    let mapped = match &event {
                        Event::Connected(_) => Some(SessionEvent::ConnectionOpened {
                            identity: account_identity(&client).await,
                            name: None,
                        }),
                        other => map_event(other),
                    };
                    if let Some(event) = mapped {
                        if tx.send(event).await.is_err() {
                            tracing::debug!("WhatsApp Web event dropped: session already replaced");
                        }
                    }
                }
            });

        if let Some(ref phone) = self.pair_phone {
            tracing::info!("WhatsApp Web: pair-code flow enabled for configured phone number");
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: phone.clone(),
                ..Default::default()
            });
        }

        let mut bot = builder.build().await?;
        let client = bot.client();
        // Reconnects belong to the session manager; a second engine-driven
        // reconnect would race it for the same device.
        client.enable_auto_reconnect.store(false, Ordering::Relaxed);
        let bot_task = bot.run().await?;

        Ok(SessionLink {
            connection: Arc::new(WhatsAppWebConnection {
                client,
                bot_task: Mutex::new(Some(bot_task)),
            }),
            events: rx,
        })
    }
}

// Stub implementation when feature is not enabled
#[cfg(not(feature = "whatsapp-web"))]
#[async_trait]
impl SessionConnector for WhatsAppWebConnector {
    async fn connect(&self, _credentials: Option<Credentials>) -> Result<SessionLink> {
        anyhow::bail!(
            "WhatsApp Web engine requires the 'whatsapp-web' feature. \
            Enable with: cargo build --features whatsapp-web"
        );
    }
}
