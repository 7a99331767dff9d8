//! MCP keep-alive stream: one `connected` event, then comment heartbeats.

use super::AppState;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn connected_event(state: &AppState) -> Event {
    let connectivity = state.session.connectivity();
    Event::default().event("connected").data(
        serde_json::json!({
            "server": env!("CARGO_PKG_NAME"),
            "connected": connectivity.is_connected(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string(),
    )
}

pub fn keepalive_stream(
    first: Event,
    period: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let start = tokio::time::Instant::now() + period;
    let heartbeats = IntervalStream::new(tokio::time::interval_at(start, period))
        .map(|_| Ok(Event::default().comment("heartbeat")));
    stream::once(async move { Ok(first) }).chain(heartbeats)
}

/// GET /mcp/sse
pub async fn handle_mcp_sse(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(keepalive_stream(connected_event(&state), HEARTBEAT_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_item_is_immediate_then_heartbeats_follow_period() {
        let stream = keepalive_stream(Event::default().event("connected"), HEARTBEAT_INTERVAL);
        tokio::pin!(stream);

        let started = tokio::time::Instant::now();
        assert!(stream.next().await.is_some());
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert!(stream.next().await.is_some());
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL);
        assert!(stream.next().await.is_some());
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL * 2);
    }
}
