//! Outbound dispatcher.
//!
//! Two delivery modes: [`DeliveryMode::Awaited`] resolves with the provider
//! message id, [`DeliveryMode::FireAndForget`] acknowledges immediately and
//! spawns a detached task whose outcome is only logged.

use crate::session::{SessionConnection, SessionState};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Awaited,
    FireAndForget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: String },
    Queued,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("WhatsApp not connected")]
    NotConnected,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Bare numbers get `@<domain>`; anything with an `@` is used verbatim.
pub fn normalize_destination(destination: &str, default_domain: &str) -> String {
    if destination.contains('@') {
        destination.to_string()
    } else {
        format!("{destination}@{default_domain}")
    }
}

pub struct OutboundDispatcher {
    state: Arc<SessionState>,
    default_domain: String,
}

impl OutboundDispatcher {
    pub fn new(state: Arc<SessionState>, default_domain: impl Into<String>) -> Self {
        Self {
            state,
            default_domain: default_domain.into(),
        }
    }

    pub fn normalize_destination(&self, destination: &str) -> String {
        normalize_destination(destination, &self.default_domain)
    }

    pub async fn send(
        &self,
        request: OutboundRequest,
        mode: DeliveryMode,
    ) -> Result<SendOutcome, DispatchError> {
        match mode {
            DeliveryMode::Awaited => self
                .send_awaited(request)
                .await
                .map(|message_id| SendOutcome::Delivered { message_id }),
            DeliveryMode::FireAndForget => self.send_detached(request).map(|()| SendOutcome::Queued),
        }
    }

    /// Wait for the engine; errors go back to the caller, no retry.
    pub async fn send_awaited(&self, request: OutboundRequest) -> Result<String, DispatchError> {
        let (handle, destination, text) = self.prepare(request)?;
        deliver(handle.as_ref(), &destination, &text).await
    }

    /// Acknowledge now; the outcome is only logged.
    pub fn send_detached(&self, request: OutboundRequest) -> Result<(), DispatchError> {
        let (handle, destination, text) = self.prepare(request)?;
        tokio::spawn(async move {
            match deliver(handle.as_ref(), &destination, &text).await {
                Ok(message_id) => {
                    tracing::info!(to = %destination, %message_id, "Queued message delivered");
                }
                Err(e) => tracing::error!(to = %destination, "Queued message failed: {e}"),
            }
        });
        Ok(())
    }

    fn prepare(
        &self,
        request: OutboundRequest,
    ) -> Result<(Arc<dyn SessionConnection>, String, String), DispatchError> {
        let destination = request.destination.trim();
        if destination.is_empty() {
            return Err(DispatchError::InvalidRequest("number is required".into()));
        }
        if request.text.is_empty() {
            return Err(DispatchError::InvalidRequest("message is required".into()));
        }
        let (handle, _identity) = self
            .state
            .connected_handle()
            .ok_or(DispatchError::NotConnected)?;
        Ok((handle, self.normalize_destination(destination), request.text))
    }
}

async fn deliver(
    handle: &dyn SessionConnection,
    destination: &str,
    text: &str,
) -> Result<String, DispatchError> {
    handle
        .send_text(destination, text)
        .await
        .map_err(|e| DispatchError::SendFailed(format!("{e:#}")))
}
