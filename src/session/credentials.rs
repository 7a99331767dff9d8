//! Credential persistence across restarts.

use super::Credentials;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Human-readable location for logs.
    fn location(&self) -> String;

    /// `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<Credentials>>;

    /// Durably replace the stored snapshot.
    async fn persist(&self, credentials: &Credentials) -> Result<()>;

    /// Forget everything; the next start needs a fresh pairing.
    async fn clear(&self) -> Result<()>;
}

/// JSON snapshot in `<dir>/creds.json`.
pub struct FileCredentialStore {
    dir: PathBuf,
}

const CREDS_FILE: &str = "creds.json";

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    async fn load(&self) -> Result<Option<Credentials>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create auth directory {}", self.dir.display()))?;

        let path = self.file();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt credential file {}", path.display()))?;
        Ok(Some(Credentials(value)))
    }

    async fn persist(&self, credentials: &Credentials) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create auth directory {}", self.dir.display()))?;

        let data = serde_json::to_vec_pretty(&credentials.0)
            .context("Failed to serialize credentials")?;
        let temp_path = self
            .dir
            .join(format!(".{CREDS_FILE}.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp_path, data)
            .await
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&temp_path, self.file()).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace credentials: {e}");
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove auth directory {}", self.dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_creates_dir_and_reports_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("auth_info"));
        assert!(store.load().await.unwrap().is_none());
        assert!(store.dir().is_dir());
    }

    #[tokio::test]
    async fn persist_then_load_returns_latest_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store
            .persist(&Credentials(serde_json::json!({"registrationId": 1})))
            .await
            .unwrap();
        store
            .persist(&Credentials(serde_json::json!({"registrationId": 2})))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.0["registrationId"], 2);

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CREDS_FILE), b"{not json").unwrap();
        let store = FileCredentialStore::new(tmp.path());
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("auth"));
        store
            .persist(&Credentials(serde_json::json!({})))
            .await
            .unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
