//! Inbound fan-out.
//!
//! Each consumer gets its own worker task fed by a bounded lane, so a slow or
//! failing consumer never stalls the session event loop or its siblings.
//! Sequential consumers see events strictly in arrival order. Concurrent ones
//! (the webhook) get one task per delivery, started in arrival order, so a
//! hung endpoint costs each event its own timeout and nothing more.

pub mod webhook;

pub use webhook::WebhookForwarder;

use crate::session::RawMessage;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Placeholder text for messages without a text body.
pub const MEDIA_PLACEHOLDER: &str = "[Media]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEvent {
    pub sender_address: String,
    pub text: String,
    pub timestamp: i64,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

#[async_trait]
pub trait InboundConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a delivery must finish before the next one starts.
    fn sequential(&self) -> bool {
        true
    }

    async fn consume(&self, event: &InboundEvent) -> Result<()>;
}

/// Plain text, else the rich-text body, else the media placeholder.
pub fn extract_text(raw: &RawMessage) -> String {
    raw.conversation
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| raw.extended_text.as_deref().filter(|t| !t.is_empty()))
        .unwrap_or(MEDIA_PLACEHOLDER)
        .to_string()
}

/// `15551234567:12@s.whatsapp.net` -> `15551234567`
fn account_user(address: &str) -> &str {
    let user = address.split_once('@').map_or(address, |(user, _)| user);
    user.split_once(':').map_or(user, |(user, _)| user)
}

/// Authored by this session, either flagged by the engine or sent from our own account.
pub fn is_self_authored(raw: &RawMessage, own_identity: Option<&str>) -> bool {
    if raw.from_me {
        return true;
    }
    match own_identity {
        Some(own) => {
            let own = account_user(own);
            !own.is_empty() && account_user(&raw.remote_jid) == own
        }
        None => false,
    }
}

pub fn to_event(raw: &RawMessage) -> InboundEvent {
    InboundEvent {
        sender_address: raw.remote_jid.clone(),
        text: extract_text(raw),
        timestamp: raw.timestamp,
        message_id: raw.id.clone(),
        sender_name: raw.push_name.clone().filter(|n| !n.trim().is_empty()),
    }
}

/// Events a lane holds before new ones are dropped for that consumer.
pub const LANE_CAPACITY: usize = 1024;

struct Lane {
    name: String,
    tx: mpsc::Sender<Arc<InboundEvent>>,
}

pub struct InboundFanOut {
    lanes: Vec<Lane>,
}

impl InboundFanOut {
    /// Spawns one worker per consumer; must be called inside a tokio runtime.
    pub fn new(consumers: Vec<Arc<dyn InboundConsumer>>) -> Self {
        Self::with_capacity(consumers, LANE_CAPACITY)
    }

    pub fn with_capacity(consumers: Vec<Arc<dyn InboundConsumer>>, capacity: usize) -> Self {
        let lanes = consumers
            .into_iter()
            .map(|consumer| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let name = consumer.name().to_string();
                tokio::spawn(run_lane(consumer, rx));
                Lane { name, tx }
            })
            .collect();
        Self { lanes }
    }

    pub fn consumer_names(&self) -> Vec<&str> {
        self.lanes.iter().map(|l| l.name.as_str()).collect()
    }

    /// Handle one engine batch. Only the first message is considered.
    pub fn handle_batch(&self, batch: Vec<RawMessage>, own_identity: Option<&str>) {
        let Some(raw) = batch.into_iter().next() else {
            return;
        };
        if is_self_authored(&raw, own_identity) {
            tracing::debug!(message_id = %raw.id, "Skipping self-authored message");
            return;
        }
        let event = to_event(&raw);
        tracing::info!(
            from = %event.sender_address,
            message_id = %event.message_id,
            "Inbound message"
        );
        self.dispatch(event);
    }

    /// Queue `event` for every consumer without waiting on any of them.
    pub fn dispatch(&self, event: InboundEvent) {
        let event = Arc::new(event);
        for lane in &self.lanes {
            match lane.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => tracing::warn!(
                    consumer = %lane.name,
                    message_id = %dropped.message_id,
                    "Inbound lane full, dropping event"
                ),
                Err(TrySendError::Closed(_)) => {
                    tracing::error!(consumer = %lane.name, "Inbound consumer worker is gone");
                }
            }
        }
    }
}

async fn run_lane(consumer: Arc<dyn InboundConsumer>, mut rx: mpsc::Receiver<Arc<InboundEvent>>) {
    let sequential = consumer.sequential();
    while let Some(event) = rx.recv().await {
        if sequential {
            deliver(&consumer, &event).await;
        } else {
            let consumer = consumer.clone();
            tokio::spawn(async move { deliver(&consumer, &event).await });
        }
    }
}

async fn deliver(consumer: &Arc<dyn InboundConsumer>, event: &InboundEvent) {
    let outcome = AssertUnwindSafe(consumer.consume(event))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(
            consumer = consumer.name(),
            message_id = %event.message_id,
            "Inbound consumer failed: {e:#}"
        ),
        Err(_) => tracing::error!(
            consumer = consumer.name(),
            message_id = %event.message_id,
            "Inbound consumer panicked"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn raw(jid: &str, id: &str, text: &str) -> RawMessage {
        RawMessage {
            remote_jid: jid.into(),
            id: id.into(),
            timestamp: 1_700_000_000,
            conversation: Some(text.into()),
            ..RawMessage::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InboundConsumer for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn consume(&self, event: &InboundEvent) -> Result<()> {
            self.seen.lock().push(event.message_id.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl InboundConsumer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn consume(&self, event: &InboundEvent) -> Result<()> {
            if event.message_id == "PANIC" {
                panic!("consumer blew up");
            }
            anyhow::bail!("webhook unreachable")
        }
    }

    /// Records each delivery as it starts, then hangs like an unresponsive endpoint.
    struct Hanging {
        sequential: bool,
        started: Mutex<Vec<String>>,
        gate: tokio::sync::Semaphore,
    }

    impl Hanging {
        fn new(sequential: bool) -> Self {
            Self {
                sequential,
                started: Mutex::new(Vec::new()),
                gate: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl InboundConsumer for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        fn sequential(&self) -> bool {
            self.sequential
        }

        async fn consume(&self, event: &InboundEvent) -> Result<()> {
            self.started.lock().push(event.message_id.clone());
            self.gate.acquire().await?.forget();
            Ok(())
        }
    }

    async fn wait_started(consumer: &Hanging, n: usize) -> Vec<String> {
        for _ in 0..100 {
            if consumer.started.lock().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        consumer.started.lock().clone()
    }

    async fn wait_for(recorder: &Recorder, n: usize) -> Vec<String> {
        for _ in 0..100 {
            if recorder.seen.lock().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recorder.seen.lock().clone()
    }

    #[test]
    fn extract_text_prefers_plain_then_extended_then_placeholder() {
        let mut m = RawMessage {
            conversation: Some("plain".into()),
            extended_text: Some("rich".into()),
            ..RawMessage::default()
        };
        assert_eq!(extract_text(&m), "plain");
        m.conversation = None;
        assert_eq!(extract_text(&m), "rich");
        m.extended_text = None;
        assert_eq!(extract_text(&m), MEDIA_PLACEHOLDER);
    }

    #[test]
    fn self_filter_matches_flag_and_account() {
        let mut m = raw("15550001111@s.whatsapp.net", "1", "hi");
        assert!(!is_self_authored(&m, None));
        assert!(is_self_authored(&m, Some("15550001111:3@s.whatsapp.net")));
        assert!(!is_self_authored(&m, Some("15559998888@s.whatsapp.net")));
        m.from_me = true;
        assert!(is_self_authored(&m, Some("15559998888@s.whatsapp.net")));
    }

    #[test]
    fn event_drops_blank_display_name() {
        let mut m = raw("1@s.whatsapp.net", "1", "hi");
        m.push_name = Some("  ".into());
        assert!(to_event(&m).sender_name.is_none());
        m.push_name = Some("Ana".into());
        assert_eq!(to_event(&m).sender_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn only_first_message_of_batch_is_processed() {
        let rec = Arc::new(Recorder {
            name: "rec",
            ..Recorder::default()
        });
        let fanout = InboundFanOut::new(vec![rec.clone() as Arc<dyn InboundConsumer>]);
        fanout.handle_batch(
            vec![
                raw("1@s.whatsapp.net", "A", "first"),
                raw("1@s.whatsapp.net", "B", "second"),
            ],
            None,
        );
        fanout.handle_batch(Vec::new(), None);
        fanout.handle_batch(vec![raw("2@s.whatsapp.net", "C", "third")], None);

        assert_eq!(wait_for(&rec, 2).await, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn failing_consumer_does_not_block_sibling_or_next_event() {
        let rec = Arc::new(Recorder {
            name: "persistence",
            ..Recorder::default()
        });
        let fanout = InboundFanOut::new(vec![
            Arc::new(Failing) as Arc<dyn InboundConsumer>,
            rec.clone(),
        ]);
        assert_eq!(fanout.consumer_names(), vec!["failing", "persistence"]);

        for id in ["E1", "PANIC", "E3"] {
            fanout.handle_batch(vec![raw("1@s.whatsapp.net", id, "x")], None);
        }

        assert_eq!(wait_for(&rec, 3).await, vec!["E1", "PANIC", "E3"]);
    }

    #[tokio::test]
    async fn self_authored_never_reaches_consumers() {
        let rec = Arc::new(Recorder {
            name: "rec",
            ..Recorder::default()
        });
        let fanout = InboundFanOut::new(vec![rec.clone() as Arc<dyn InboundConsumer>]);
        let mut own = raw("9@s.whatsapp.net", "OWN", "mine");
        own.from_me = true;
        fanout.handle_batch(vec![own], Some("15550001111@s.whatsapp.net"));
        fanout.handle_batch(vec![raw("9@s.whatsapp.net", "THEIRS", "yours")], None);

        assert_eq!(wait_for(&rec, 1).await, vec!["THEIRS"]);
    }

    #[tokio::test]
    async fn concurrent_consumer_starts_every_delivery_without_waiting() {
        let hanging = Arc::new(Hanging::new(false));
        let fanout = InboundFanOut::new(vec![hanging.clone() as Arc<dyn InboundConsumer>]);
        for id in ["H1", "H2", "H3", "H4", "H5"] {
            fanout.handle_batch(vec![raw("1@s.whatsapp.net", id, "x")], None);
        }

        let mut started = wait_started(&hanging, 5).await;
        started.sort();
        assert_eq!(started, vec!["H1", "H2", "H3", "H4", "H5"]);
    }

    #[tokio::test]
    async fn full_lane_drops_new_events_instead_of_blocking() {
        let hanging = Arc::new(Hanging::new(true));
        let fanout =
            InboundFanOut::with_capacity(vec![hanging.clone() as Arc<dyn InboundConsumer>], 2);

        fanout.dispatch(to_event(&raw("1@s.whatsapp.net", "HELD", "x")));
        assert_eq!(wait_started(&hanging, 1).await, vec!["HELD"]);
        for n in 0..8 {
            fanout.dispatch(to_event(&raw("1@s.whatsapp.net", &format!("Q{n}"), "x")));
        }

        hanging.gate.add_permits(16);
        assert_eq!(wait_started(&hanging, 3).await, vec!["HELD", "Q0", "Q1"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hanging.started.lock().len(), 3);
    }
}
