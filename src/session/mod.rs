//! Single-session data model and the seams to the protocol engine.
//!
//! The engine is reached through two traits: [`SessionConnector`] builds a
//! fresh connection from stored credentials, and the resulting
//! [`SessionLink`] carries the send handle plus a typed event stream that the
//! [`manager::SessionManager`] drains from one loop.

pub mod credentials;
pub mod manager;
pub mod state;

pub use credentials::{CredentialStore, FileCredentialStore};
pub use manager::{ReconnectPolicy, Recovery, SessionManager};
pub use state::{PairingChallenge, SessionSnapshot, SessionState};

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Person-to-person address domain of the messaging network.
pub const DEFAULT_USER_DOMAIN: &str = "s.whatsapp.net";

/// Whether a disconnect allows automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Explicit unpairing; operator must pair again.
    Terminal,
    /// Reconnect is scheduled.
    Retrying,
}

impl DisconnectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    Initializing,
    PairingRequired,
    /// Carries the authenticated account identifier.
    Connected { identity: String },
    Disconnected {
        kind: DisconnectKind,
        reason: DisconnectReason,
    },
}

impl ConnectivityState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Connected { identity } => Some(identity),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::PairingRequired => "pairing_required",
            Self::Connected { .. } => "connected",
            Self::Disconnected {
                kind: DisconnectKind::Terminal,
                ..
            } => "logged_out",
            Self::Disconnected { .. } => "reconnecting",
        }
    }
}

/// Classified close reason reported by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    Unavailable,
    /// The engine's event stream ended without a close event.
    StreamEnded,
    Other(String),
}

impl DisconnectReason {
    /// Map a numeric close code as reported by the network.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            411 => Self::MultideviceMismatch,
            403 => Self::Forbidden,
            503 => Self::Unavailable,
            other => Self::Other(format!("status {other}")),
        }
    }

    /// Only an explicit logout stops the reconnect loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::BadSession => f.write_str("bad session"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::MultideviceMismatch => f.write_str("multi-device mismatch"),
            Self::Forbidden => f.write_str("forbidden"),
            Self::Unavailable => f.write_str("service unavailable"),
            Self::StreamEnded => f.write_str("event stream ended"),
            Self::Other(detail) => f.write_str(detail),
        }
    }
}

/// Opaque authentication material. Never logged.
#[derive(Clone, PartialEq)]
pub struct Credentials(pub serde_json::Value);

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// One message as delivered by the engine, before extraction.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub remote_jid: String,
    pub from_me: bool,
    pub id: String,
    pub timestamp: i64,
    pub push_name: Option<String>,
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
}

#[derive(Debug)]
pub enum SessionEvent {
    ConnectionOpened {
        identity: String,
        name: Option<String>,
    },
    ConnectionClosed {
        reason: DisconnectReason,
    },
    QrChallenge(String),
    MessagesUpsert(Vec<RawMessage>),
    /// `ack` fires once the snapshot is durably stored.
    CredentialsUpdated {
        credentials: Credentials,
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Send side of a live connection.
#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Deliver `text` to a fully-qualified address, returning the provider message id.
    async fn send_text(&self, destination: &str, text: &str) -> Result<String>;

    /// Shut the engine down so it can neither reconnect nor keep the device
    /// session alive once the manager has given up on it.
    async fn close(&self) {}
}

pub struct SessionLink {
    pub connection: Arc<dyn SessionConnection>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Builds one connection per call.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<SessionLink>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every send; optionally fails them.
    #[derive(Default)]
    pub struct MockConnection {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail_with: Option<String>,
        pub closed: AtomicUsize,
    }

    impl MockConnection {
        pub fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().clone()
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionConnection for MockConnection {
        async fn send_text(&self, destination: &str, text: &str) -> Result<String> {
            self.sent
                .lock()
                .push((destination.to_string(), text.to_string()));
            if let Some(msg) = &self.fail_with {
                anyhow::bail!("{msg}");
            }
            Ok(format!("MSG{}", self.sent.lock().len()))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out pre-built links in order; errors once the script is empty.
    pub struct ScriptedConnector {
        pub links: Mutex<VecDeque<Result<SessionLink>>>,
        pub attempts: AtomicUsize,
        pub seen_credentials: Mutex<Vec<Option<Credentials>>>,
    }

    impl ScriptedConnector {
        pub fn new(links: Vec<Result<SessionLink>>) -> Self {
            Self {
                links: Mutex::new(links.into()),
                attempts: AtomicUsize::new(0),
                seen_credentials: Mutex::new(Vec::new()),
            }
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn connect(&self, credentials: Option<Credentials>) -> Result<SessionLink> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.seen_credentials.lock().push(credentials);
            self.links
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted connection left")))
        }
    }

    /// A link whose events are fed by the returned sender.
    pub fn link(connection: Arc<MockConnection>) -> (SessionLink, mpsc::Sender<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SessionLink {
                connection,
                events: rx,
            },
            tx,
        )
    }
}
