//! Component health for the bridge's long-running parts (gateway, session,
//! outbox feed, daemon), rolled up into one verdict for `/health`.
//!
//! A component is `starting` until its first report. `since` moves only when
//! the status changes, so a session that keeps failing to reconnect shows how
//! long it has been down, and `consecutive_failures` how many tries it took.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Starting,
    Ok,
    Error,
}

/// Whole-process verdict derived from the component table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Starting,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub since: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub restart_count: u64,
}

impl ComponentHealth {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: ComponentStatus::Starting,
            since: now,
            updated_at: now,
            last_ok: None,
            last_error: None,
            consecutive_failures: 0,
            restart_count: 0,
        }
    }

    fn transition(&mut self, status: ComponentStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.since = now;
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: Overall,
    pub pid: u32,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

pub struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_component(
        &self,
        component: &str,
        apply: impl FnOnce(&mut ComponentHealth, DateTime<Utc>),
    ) {
        let now = Utc::now();
        let mut components = self.components.lock();
        let entry = components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(now));
        apply(entry, now);
    }

    pub fn report_ok(&self, component: &str) {
        self.with_component(component, |entry, now| {
            entry.transition(ComponentStatus::Ok, now);
            entry.last_ok = Some(now);
            entry.last_error = None;
            entry.consecutive_failures = 0;
        });
    }

    pub fn report_error(&self, component: &str, error: impl ToString) {
        let error = error.to_string();
        self.with_component(component, move |entry, now| {
            entry.transition(ComponentStatus::Error, now);
            entry.last_error = Some(error);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        });
    }

    pub fn report_restart(&self, component: &str) {
        self.with_component(component, |entry, now| {
            entry.restart_count = entry.restart_count.saturating_add(1);
            entry.updated_at = now;
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components = self.components.lock().clone();
        HealthSnapshot {
            overall: rollup(&components),
            pid: std::process::id(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components,
        }
    }
}

/// Any error degrades the process; otherwise it is starting until every
/// component has reported ok.
fn rollup(components: &BTreeMap<String, ComponentHealth>) -> Overall {
    let statuses = || components.values().map(|c| c.status);
    if statuses().any(|s| s == ComponentStatus::Error) {
        Overall::Degraded
    } else if components.is_empty() || statuses().any(|s| s == ComponentStatus::Starting) {
        Overall::Starting
    } else {
        Overall::Healthy
    }
}

static GLOBAL: OnceLock<HealthRegistry> = OnceLock::new();

/// Registry shared by the whole process.
pub fn global() -> &'static HealthRegistry {
    GLOBAL.get_or_init(HealthRegistry::new)
}

pub fn report_ok(component: &str) {
    global().report_ok(component);
}

pub fn report_error(component: &str, error: impl ToString) {
    global().report_error(component, error);
}

pub fn report_restart(component: &str) {
    global().report_restart(component);
}

pub fn snapshot() -> HealthSnapshot {
    global().snapshot()
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize health snapshot: {e}");
        serde_json::json!({ "overall": "degraded", "components": {} })
    })
}
