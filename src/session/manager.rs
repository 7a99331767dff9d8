use super::{
    ConnectivityState, CredentialStore, DisconnectKind, DisconnectReason, SessionConnector,
    SessionEvent, SessionState,
};
use crate::inbound::InboundFanOut;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const COMPONENT: &str = "session";

/// Fixed delays; retries are unbounded.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// After a non-terminal close.
    pub reconnect_delay: Duration,
    /// After the connection could not be built at all.
    pub construction_retry: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            construction_retry: Duration::from_secs(5),
        }
    }
}

/// What the run loop does after the current connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Reconnect(Duration),
    Halt,
}

/// Owns the single session: builds it, drains its events, rebuilds it.
pub struct SessionManager {
    state: Arc<SessionState>,
    connector: Arc<dyn SessionConnector>,
    credentials: Arc<dyn CredentialStore>,
    fanout: Arc<InboundFanOut>,
    policy: ReconnectPolicy,
}

impl SessionManager {
    pub fn new(
        state: Arc<SessionState>,
        connector: Arc<dyn SessionConnector>,
        credentials: Arc<dyn CredentialStore>,
        fanout: Arc<InboundFanOut>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            state,
            connector,
            credentials,
            fanout,
            policy,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Build a fresh connection and publish its handle.
    ///
    /// Must not be called while another connection from this manager is live;
    /// [`SessionManager::run`] only calls it after the previous one ended.
    pub async fn start(&self) -> Result<mpsc::Receiver<SessionEvent>> {
        let credentials = self
            .credentials
            .load()
            .await
            .with_context(|| format!("Failed to load credentials from {}", self.credentials.location()))?;
        if credentials.is_none() {
            tracing::info!("No stored credentials; a new pairing will be required");
        }

        let link = self
            .connector
            .connect(credentials)
            .await
            .context("Failed to construct session connection")?;

        self.state.publish_handle(Some(link.connection));
        self.state.set_connectivity(ConnectivityState::Initializing);
        Ok(link.events)
    }

    /// Apply one engine event. Returns a recovery step once the connection is over.
    pub async fn handle_event(&self, event: SessionEvent) -> Option<Recovery> {
        match event {
            SessionEvent::QrChallenge(token) => {
                self.on_qr(token);
                None
            }
            SessionEvent::ConnectionOpened { identity, name } => {
                tracing::info!(%identity, "WhatsApp session connected");
                self.state.mark_connected(identity, name);
                crate::health::report_ok(COMPONENT);
                None
            }
            SessionEvent::ConnectionClosed { reason } => Some(self.on_close(reason).await),
            SessionEvent::CredentialsUpdated { credentials, ack } => {
                if let Err(e) = self.credentials.persist(&credentials).await {
                    tracing::error!("Failed to persist updated credentials: {e:#}");
                    crate::health::report_error(COMPONENT, format!("credentials: {e}"));
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                None
            }
            SessionEvent::MessagesUpsert(batch) => {
                let connectivity = self.state.connectivity();
                self.fanout.handle_batch(batch, connectivity.identity());
                None
            }
        }
    }

    fn on_qr(&self, token: String) {
        self.state.set_pairing(token.clone());
        if !self.state.connectivity().is_connected() {
            self.state.set_connectivity(ConnectivityState::PairingRequired);
        }
        tracing::info!("Pairing QR issued (scan in WhatsApp > Linked Devices, or open /qr)");
        match crate::gateway::qr::render_terminal(&token) {
            Ok(rendered) => {
                eprintln!();
                eprintln!("WhatsApp pairing QR (scan in WhatsApp > Linked Devices):");
                eprintln!("{rendered}");
                eprintln!();
            }
            Err(err) => {
                tracing::warn!("Failed to render pairing QR in terminal: {err}");
            }
        }
    }

    async fn on_close(&self, reason: DisconnectReason) -> Recovery {
        // Readers lose the handle first; the engine is then stopped so only
        // this manager ever brings the session back.
        if let Some(previous) = self.state.publish_handle(None) {
            previous.close().await;
        }
        if reason.is_terminal() {
            tracing::warn!(
                "WhatsApp session logged out; not reconnecting. Run `wabridge reset-session` and pair again"
            );
            crate::health::report_error(COMPONENT, "logged out");
            self.state.set_connectivity(ConnectivityState::Disconnected {
                kind: DisconnectKind::Terminal,
                reason,
            });
            Recovery::Halt
        } else {
            let delay = self.policy.reconnect_delay;
            tracing::warn!("WhatsApp session closed ({reason}); reconnecting in {delay:?}");
            crate::health::report_error(COMPONENT, reason.to_string());
            self.state.set_connectivity(ConnectivityState::Disconnected {
                kind: DisconnectKind::Retrying,
                reason,
            });
            Recovery::Reconnect(delay)
        }
    }

    /// Drive the session until a terminal disconnect.
    pub async fn run(&self) -> Result<()> {
        loop {
            let mut events = match self.start().await {
                Ok(events) => events,
                Err(e) => {
                    let delay = self.policy.construction_retry;
                    tracing::error!("Session start failed: {e:#}; retrying in {delay:?}");
                    crate::health::report_error(COMPONENT, e.to_string());
                    crate::health::report_restart(COMPONENT);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let recovery = loop {
                match events.recv().await {
                    Some(event) => {
                        if let Some(recovery) = self.handle_event(event).await {
                            break recovery;
                        }
                    }
                    None => break self.on_close(DisconnectReason::StreamEnded).await,
                }
            };
            drop(events);

            match recovery {
                Recovery::Halt => return Ok(()),
                Recovery::Reconnect(delay) => {
                    crate::health::report_restart(COMPONENT);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
