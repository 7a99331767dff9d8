#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wabridge::config::SendMode;
use wabridge::dispatch::OutboundDispatcher;
use wabridge::gateway::{AppState, build_router};
use wabridge::inbound::{InboundConsumer, InboundFanOut, WebhookForwarder};
use wabridge::session::{
    Credentials, FileCredentialStore, ReconnectPolicy, SessionConnection, SessionConnector,
    SessionEvent, SessionLink, SessionManager, SessionState, DEFAULT_USER_DOMAIN,
};

/// Records sends and answers with sequential ids.
#[derive(Default)]
pub struct RecordingConnection {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SessionConnection for RecordingConnection {
    async fn send_text(&self, destination: &str, text: &str) -> Result<String> {
        let mut sent = self.sent.lock();
        sent.push((destination.to_string(), text.to_string()));
        Ok(format!("3EB0{:04}", sent.len()))
    }
}

/// Hands out one link built around a shared recording connection.
pub struct SingleLinkConnector {
    pub connection: Arc<RecordingConnection>,
    pending: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

#[async_trait]
impl SessionConnector for SingleLinkConnector {
    async fn connect(&self, _credentials: Option<Credentials>) -> Result<SessionLink> {
        let events = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("already connected once"))?;
        Ok(SessionLink {
            connection: self.connection.clone(),
            events,
        })
    }
}

pub struct Bridge {
    pub manager: Arc<SessionManager>,
    pub session: Arc<SessionState>,
    pub connection: Arc<RecordingConnection>,
    pub events: mpsc::Sender<SessionEvent>,
    pub _auth: TempDir,
}

impl Bridge {
    pub async fn start(consumers: Vec<Arc<dyn InboundConsumer>>) -> Self {
        let auth = TempDir::new().unwrap();
        let (events, rx) = mpsc::channel(32);
        let connection = Arc::new(RecordingConnection::default());
        let connector = Arc::new(SingleLinkConnector {
            connection: connection.clone(),
            pending: Mutex::new(Some(rx)),
        });
        let session = Arc::new(SessionState::new());
        let manager = Arc::new(SessionManager::new(
            session.clone(),
            connector,
            Arc::new(FileCredentialStore::new(auth.path().join("auth_info"))),
            Arc::new(InboundFanOut::new(consumers)),
            ReconnectPolicy::default(),
        ));

        let runner = manager.clone();
        tokio::spawn(async move { runner.run().await });

        Self {
            manager,
            session,
            connection,
            events,
            _auth: auth,
        }
    }

    pub async fn emit(&self, event: SessionEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn connect_as(&self, identity: &str) {
        self.emit(SessionEvent::ConnectionOpened {
            identity: identity.into(),
            name: Some("Bridge".into()),
        })
        .await;
        let session = self.session.clone();
        wait_until(move || session.connectivity().is_connected()).await;
    }

    pub fn app_state(&self, webhook: Option<Arc<WebhookForwarder>>, mode: SendMode) -> AppState {
        AppState {
            session: self.session.clone(),
            dispatcher: Arc::new(OutboundDispatcher::new(
                self.session.clone(),
                DEFAULT_USER_DOMAIN,
            )),
            webhook,
            send_mode: mode,
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.connection.sent.lock().clone()
    }
}

/// Serve the router on an ephemeral port and return its base URL.
pub async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state, 64 * 1024))
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
