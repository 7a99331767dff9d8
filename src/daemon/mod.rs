use crate::config::Config;
use crate::dispatch::OutboundDispatcher;
use crate::gateway::{self, AppState};
use crate::inbound::{InboundConsumer, InboundFanOut, WebhookForwarder};
use crate::session::{
    FileCredentialStore, ReconnectPolicy, SessionConnector, SessionManager, SessionState,
};
use crate::store::{InboxSink, OutboxListener, StoreClient};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const SUPERVISOR_INITIAL_BACKOFF_SECS: u64 = 2;
const SUPERVISOR_MAX_BACKOFF_SECS: u64 = 60;

/// Build every component, run until Ctrl+C, then abort without draining.
pub async fn run(config: Config, connector: Arc<dyn SessionConnector>) -> Result<()> {
    crate::health::report_ok("daemon");

    let session = Arc::new(SessionState::new());
    let dispatcher = Arc::new(OutboundDispatcher::new(
        session.clone(),
        config.session.default_domain.clone(),
    ));

    let store = match StoreClient::from_config(&config.store)? {
        Some(store) => Some(Arc::new(store)),
        None => {
            tracing::warn!(
                "Durable store not configured (SUPABASE_URL / SUPABASE_KEY); inbox persistence and outbox feed disabled"
            );
            None
        }
    };

    let webhook = match config.webhook.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Some(Arc::new(WebhookForwarder::new(
            url.to_string(),
            config.webhook.bearer_token.clone(),
            Duration::from_secs(config.webhook.timeout_secs.max(1)),
        )?)),
        _ => {
            tracing::warn!("No webhook URL configured; inbound messages will not be forwarded");
            None
        }
    };

    let mut consumers: Vec<Arc<dyn InboundConsumer>> = Vec::new();
    if let Some(webhook) = &webhook {
        consumers.push(webhook.clone());
    }
    if let Some(store) = &store {
        consumers.push(Arc::new(InboxSink::new(store.clone())));
    }
    let fanout = Arc::new(InboundFanOut::new(consumers));

    let auth_dir = config.auth_dir();
    let manager = Arc::new(SessionManager::new(
        session.clone(),
        connector,
        Arc::new(FileCredentialStore::new(auth_dir.clone())),
        fanout.clone(),
        ReconnectPolicy {
            reconnect_delay: Duration::from_secs(config.session.reconnect_delay_secs),
            construction_retry: Duration::from_secs(config.session.construction_retry_secs),
        },
    ));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    handles.push(tokio::spawn({
        let manager = manager.clone();
        async move {
            if let Err(e) = manager.run().await {
                crate::health::report_error("session", e.to_string());
                tracing::error!("Session manager stopped: {e:#}");
            }
        }
    }));

    {
        let state = AppState {
            session: session.clone(),
            dispatcher: dispatcher.clone(),
            webhook: webhook.clone(),
            send_mode: config.gateway.send_mode,
        };
        let host = config.gateway.host.clone();
        let port = config.gateway.port;
        let max_body = config.gateway.max_body_bytes;
        handles.push(spawn_component_supervisor(
            "gateway",
            SUPERVISOR_INITIAL_BACKOFF_SECS,
            SUPERVISOR_MAX_BACKOFF_SECS,
            move || {
                let state = state.clone();
                let host = host.clone();
                async move { gateway::run_gateway(&host, port, state, max_body).await }
            },
        ));
    }

    match &store {
        Some(store) if config.store.subscribe_outbox => {
            let listener = Arc::new(OutboxListener::new(
                store.clone(),
                session.clone(),
                dispatcher.clone(),
            ));
            handles.push(spawn_component_supervisor(
                "outbox",
                SUPERVISOR_INITIAL_BACKOFF_SECS,
                SUPERVISOR_MAX_BACKOFF_SECS,
                move || {
                    let listener = listener.clone();
                    async move { listener.run().await }
                },
            ));
        }
        _ => tracing::info!("Outbox change-feed disabled"),
    }

    println!("WhatsApp bridge started");
    println!("   Gateway:   http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Auth dir:  {}", auth_dir.display());
    println!("   Consumers: {}", consumer_summary(&fanout));
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested; in-flight sends are abandoned");
    crate::health::report_error("daemon", "shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn consumer_summary(fanout: &InboundFanOut) -> String {
    let names = fanout.consumer_names();
    if names.is_empty() {
        "none".into()
    } else {
        names.join(", ")
    }
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::report_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::report_error(name, "component exited unexpectedly");
                    tracing::warn!("Component '{name}' exited unexpectedly");
                }
                Err(e) => {
                    crate::health::report_error(name, e.to_string());
                    tracing::error!("Component '{name}' failed: {e:#}");
                }
            }

            crate::health::report_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
