use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the loaded config file (computed, never serialized)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        Self {
            config_path: home.join(".wabridge").join("config.toml"),
            log_level: default_log_level(),
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            webhook: WebhookConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

/// Delivery policy applied by `POST /send-message` when the caller does not pick one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    #[default]
    Awaited,
    Queued,
}

impl SendMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "awaited" | "await" | "sync" => Some(Self::Awaited),
            "queued" | "queue" | "fire-and-forget" | "async" => Some(Self::Queued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 3000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default)]
    pub send_mode: SendMode,
    /// Request body cap for every route
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_max_body_bytes() -> usize {
    65_536
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            send_mode: SendMode::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Credential directory. Empty means `<config dir>/auth_info`.
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_construction_retry_secs")]
    pub construction_retry_secs: u64,
    /// Suffix appended to bare numbers on outbound sends
    #[serde(default = "default_domain")]
    pub default_domain: String,
    /// Optional phone number for pair-code linking instead of QR
    #[serde(default)]
    pub pair_phone: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_dir: None,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            construction_retry_secs: default_construction_retry_secs(),
            default_domain: default_domain(),
            pair_phone: None,
        }
    }
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_construction_retry_secs() -> u64 {
    5
}

fn default_domain() -> String {
    crate::session::DEFAULT_USER_DOMAIN.into()
}

// ── Webhook ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Automation endpoint receiving inbound events. Unset disables forwarding.
    #[serde(default)]
    pub url: Option<String>,
    /// Sent as `Authorization: Bearer <token>` when present
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            bearer_token: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

// ── Durable store ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_store_schema")]
    pub schema: String,
    #[serde(default = "default_inbox_table")]
    pub inbox_table: String,
    #[serde(default = "default_outbox_table")]
    pub outbox_table: String,
    /// Listen for outbox inserts over the realtime websocket
    #[serde(default = "default_true")]
    pub subscribe_outbox: bool,
}

fn default_store_schema() -> String {
    "public".into()
}

fn default_inbox_table() -> String {
    "inbox_whatsapp".into()
}

fn default_outbox_table() -> String {
    "outbox_whatsapp".into()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            schema: default_store_schema(),
            inbox_table: default_inbox_table(),
            outbox_table: default_outbox_table(),
            subscribe_outbox: true,
        }
    }
}

impl StoreConfig {
    /// Url and key together, or nothing.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())?;
        Some((url, key))
    }
}

// ── Loading & saving ─────────────────────────────────────────────

impl Config {
    /// Load `path` (or `~/.wabridge/config.toml`), writing defaults when it does
    /// not exist yet, then apply environment overrides.
    pub fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let home = UserDirs::new()
                    .map(|u| u.home_dir().to_path_buf())
                    .context("Could not find home directory")?;
                home.join(".wabridge").join("config.toml")
            }
        };

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.save()?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Credential directory, resolved against the config directory.
    pub fn auth_dir(&self) -> PathBuf {
        match &self.session.auth_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.config_dir().join(dir),
            None => self.config_dir().join("auth_info"),
        }
    }

    fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(*k).filter(|v| !v.trim().is_empty()))
        };

        if let Some(level) = first(&["WABRIDGE_LOG_LEVEL", "LOG_LEVEL"]) {
            self.log_level = level;
        }

        // Gateway port: WABRIDGE_PORT or PORT
        if let Some(port) = first(&["WABRIDGE_PORT", "PORT"]).and_then(|p| p.parse::<u16>().ok())
        {
            self.gateway.port = port;
        }
        if let Some(host) = first(&["WABRIDGE_HOST", "HOST"]) {
            self.gateway.host = host;
        }
        if let Some(mode) = first(&["WABRIDGE_SEND_MODE"]).and_then(|m| SendMode::parse(&m)) {
            self.gateway.send_mode = mode;
        }

        if let Some(dir) = first(&["WABRIDGE_AUTH_DIR"]) {
            self.session.auth_dir = Some(PathBuf::from(dir));
        }
        if let Some(phone) = first(&["WABRIDGE_PAIR_PHONE"]) {
            self.session.pair_phone = Some(phone);
        }

        if let Some(url) = first(&["WABRIDGE_WEBHOOK_URL", "N8N_WEBHOOK_URL"]) {
            self.webhook.url = Some(url);
        }
        if let Some(token) = first(&["WABRIDGE_WEBHOOK_TOKEN", "HF_ACCESS_TOKEN"]) {
            self.webhook.bearer_token = Some(token);
        }

        if let Some(url) = first(&["SUPABASE_URL"]) {
            self.store.url = Some(url);
        }
        if let Some(key) = first(&["SUPABASE_KEY"]) {
            self.store.api_key = Some(key);
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.log_level, "info");
        assert_eq!(c.gateway.port, 3000);
        assert_eq!(c.gateway.send_mode, SendMode::Awaited);
        assert_eq!(c.session.default_domain, "s.whatsapp.net");
        assert_eq!(c.webhook.timeout_secs, 10);
        assert_eq!(c.store.inbox_table, "inbox_whatsapp");
        assert!(c.store.credentials().is_none());
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn session_defaults_apply_to_empty_section() {
        let c: Config = toml::from_str("[session]\n").unwrap();
        assert_eq!(c.session.reconnect_delay_secs, 3);
        assert_eq!(c.session.construction_retry_secs, 5);
        assert_eq!(c.session.default_domain, "s.whatsapp.net");
    }

    // ── Persistence ──────────────────────────────────────────

    #[test]
    fn load_or_init_writes_defaults_then_reads_them_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let first = Config::load_or_init(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(first.config_path, path);

        let mut edited = first.clone();
        edited.gateway.port = 4100;
        edited.webhook.url = Some("http://hooks.local/in".into());
        edited.save().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let reread: Config = toml::from_str(&raw).unwrap();
        assert_eq!(reread.gateway.port, 4100);
        assert_eq!(reread.webhook.url.as_deref(), Some("http://hooks.local/in"));
    }

    #[test]
    fn auth_dir_resolves_relative_to_config_dir() {
        let mut c = Config::default();
        c.config_path = PathBuf::from("/srv/wabridge/config.toml");
        assert_eq!(c.auth_dir(), PathBuf::from("/srv/wabridge/auth_info"));

        c.session.auth_dir = Some(PathBuf::from("creds"));
        assert_eq!(c.auth_dir(), PathBuf::from("/srv/wabridge/creds"));

        c.session.auth_dir = Some(PathBuf::from("/var/lib/wa"));
        assert_eq!(c.auth_dir(), PathBuf::from("/var/lib/wa"));
    }

    // ── Env overrides ────────────────────────────────────────

    #[test]
    fn overrides_honor_legacy_variable_names() {
        let mut c = Config::default();
        c.apply_overrides_from(lookup_from(&[
            ("PORT", "8081"),
            ("LOG_LEVEL", "debug"),
            ("N8N_WEBHOOK_URL", "https://n8n.example/webhook/wa"),
            ("HF_ACCESS_TOKEN", "hf_token"),
            ("SUPABASE_URL", "https://proj.supabase.co"),
            ("SUPABASE_KEY", "service-key"),
        ]));

        assert_eq!(c.gateway.port, 8081);
        assert_eq!(c.log_level, "debug");
        assert_eq!(
            c.webhook.url.as_deref(),
            Some("https://n8n.example/webhook/wa")
        );
        assert_eq!(c.webhook.bearer_token.as_deref(), Some("hf_token"));
        assert_eq!(
            c.store.credentials(),
            Some(("https://proj.supabase.co", "service-key"))
        );
    }

    #[test]
    fn prefixed_variables_win_over_generic_ones() {
        let mut c = Config::default();
        c.apply_overrides_from(lookup_from(&[
            ("PORT", "8081"),
            ("WABRIDGE_PORT", "9090"),
            ("WABRIDGE_SEND_MODE", "queued"),
        ]));
        assert_eq!(c.gateway.port, 9090);
        assert_eq!(c.gateway.send_mode, SendMode::Queued);
    }

    #[test]
    fn invalid_or_empty_overrides_are_ignored() {
        let mut c = Config::default();
        c.apply_overrides_from(lookup_from(&[
            ("PORT", "not-a-port"),
            ("N8N_WEBHOOK_URL", "   "),
            ("WABRIDGE_SEND_MODE", "sometimes"),
        ]));
        assert_eq!(c.gateway.port, 3000);
        assert!(c.webhook.url.is_none());
        assert_eq!(c.gateway.send_mode, SendMode::Awaited);
    }

    #[test]
    fn store_requires_both_url_and_key() {
        let mut s = StoreConfig::default();
        s.url = Some("https://proj.supabase.co".into());
        assert!(s.credentials().is_none());
        s.api_key = Some(String::new());
        assert!(s.credentials().is_none());
        s.api_key = Some("k".into());
        assert!(s.credentials().is_some());
    }
}
