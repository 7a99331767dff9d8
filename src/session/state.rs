//! Shared session state.
//!
//! Only the session manager writes; everything else reads snapshots. The
//! handle and connectivity live under one lock so a reader never pairs a new
//! handle with a stale identity.

use super::{ConnectivityState, SessionConnection};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingChallenge {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

/// Point-in-time copy for status queries.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connectivity: ConnectivityState,
    pub pairing: Option<PairingChallenge>,
    pub display_name: Option<String>,
}

struct Inner {
    handle: Option<Arc<dyn SessionConnection>>,
    connectivity: ConnectivityState,
    pairing: Option<PairingChallenge>,
    display_name: Option<String>,
}

pub struct SessionState {
    inner: RwLock<Inner>,
    changes: watch::Sender<ConnectivityState>,
}

impl SessionState {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(ConnectivityState::Initializing);
        Self {
            inner: RwLock::new(Inner {
                handle: None,
                connectivity: ConnectivityState::Initializing,
                pairing: None,
                display_name: None,
            }),
            changes,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        SessionSnapshot {
            connectivity: inner.connectivity.clone(),
            pairing: inner.pairing.clone(),
            display_name: inner.display_name.clone(),
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.read().connectivity.clone()
    }

    pub fn pairing(&self) -> Option<PairingChallenge> {
        self.inner.read().pairing.clone()
    }

    /// The current handle with its identity, only while connected.
    pub fn connected_handle(&self) -> Option<(Arc<dyn SessionConnection>, String)> {
        let inner = self.inner.read();
        let identity = inner.connectivity.identity()?.to_string();
        let handle = inner.handle.clone()?;
        Some((handle, identity))
    }

    /// Watch connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.changes.subscribe()
    }

    // ── Writers (session manager only) ───────────────────────

    /// Swap the live handle, returning the one it replaces.
    pub(crate) fn publish_handle(
        &self,
        handle: Option<Arc<dyn SessionConnection>>,
    ) -> Option<Arc<dyn SessionConnection>> {
        std::mem::replace(&mut self.inner.write().handle, handle)
    }

    pub(crate) fn set_connectivity(&self, connectivity: ConnectivityState) {
        {
            let mut inner = self.inner.write();
            if !connectivity.is_connected() {
                inner.display_name = None;
            }
            inner.connectivity = connectivity.clone();
        }
        self.changes.send_replace(connectivity);
    }

    pub(crate) fn mark_connected(&self, identity: String, display_name: Option<String>) {
        let connectivity = ConnectivityState::Connected { identity };
        {
            let mut inner = self.inner.write();
            inner.connectivity = connectivity.clone();
            inner.pairing = None;
            inner.display_name = display_name;
        }
        self.changes.send_replace(connectivity);
    }

    /// Replace any prior challenge.
    pub(crate) fn set_pairing(&self, token: String) {
        self.inner.write().pairing = Some(PairingChallenge {
            token,
            issued_at: Utc::now(),
        });
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockConnection;
    use crate::session::{DisconnectKind, DisconnectReason};

    #[test]
    fn handle_is_hidden_until_connected() {
        let state = SessionState::new();
        state.publish_handle(Some(Arc::new(MockConnection::default())));
        assert!(state.connected_handle().is_none());

        state.mark_connected("15550001111@s.whatsapp.net".into(), None);
        let (_, identity) = state.connected_handle().expect("connected");
        assert_eq!(identity, "15550001111@s.whatsapp.net");

        state.set_connectivity(ConnectivityState::Disconnected {
            kind: DisconnectKind::Retrying,
            reason: DisconnectReason::ConnectionLost,
        });
        assert!(state.connected_handle().is_none());
    }

    #[test]
    fn pairing_is_overwritten_then_cleared_on_connect() {
        let state = SessionState::new();
        state.set_pairing("first".into());
        state.set_pairing("second".into());
        assert_eq!(state.pairing().map(|p| p.token).as_deref(), Some("second"));

        state.mark_connected("me".into(), Some("Bridge".into()));
        assert!(state.pairing().is_none());
        assert_eq!(state.snapshot().display_name.as_deref(), Some("Bridge"));
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let state = SessionState::new();
        let mut rx = state.subscribe();
        state.mark_connected("me".into(), None);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_connected());
    }
}
