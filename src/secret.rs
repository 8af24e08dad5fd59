use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dotenvy::Error as DotenvError;
use thiserror::Error;
use tracing::{error, info};

use crate::auth::Credentials;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretsError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store io error: {0}")]
    Io(String),
}

/// Secrets are addressed by key but only revealed through an opaque handle,
/// so listing keys never exposes values.
#[async_trait]
pub trait SecretsManagerType: Send + Sync {
    fn get(&self, key: &str) -> Option<u32>;
    fn keys(&self) -> Vec<String>;
    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError>;
    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError>;
    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError>;
    fn name(&self) -> &'static str;
}

#[derive(Clone)]
pub struct SecretsManager(pub Arc<dyn SecretsManagerType>);

impl SecretsManager {
    pub async fn add_secret(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        self.0.add_secret(key, value).await
    }

    pub async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        self.0.delete_secret(key).await
    }

    pub async fn get_secret(&self, key: &str) -> Result<Option<String>, SecretsError> {
        match self.0.get(key) {
            Some(handle) => self.0.reveal(handle).await,
            None => Ok(None),
        }
    }

    /// Admin credentials stored for a dispatcher node under
    /// `DISPATCH_<ID>_USER` / `DISPATCH_<ID>_PASSWORD`.
    pub async fn credentials_for(&self, node_id: &str) -> Result<Credentials, SecretsError> {
        let (user_key, password_key) = credential_keys(node_id);
        Ok(Credentials {
            user: self.get_secret(&user_key).await?,
            password: self.get_secret(&password_key).await?,
        })
    }
}

impl Debug for SecretsManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SecretsManager({}, keys: {:?})", self.0.name(), self.0.keys())
    }
}

pub fn credential_keys(node_id: &str) -> (String, String) {
    let id = node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect::<String>();
    (format!("DISPATCH_{id}_USER"), format!("DISPATCH_{id}_PASSWORD"))
}

/// Secrets read from `<dir>/.env`; additions are written back to it.
pub struct EnvSecretsManager {
    handles: DashMap<String, u32>,
    secrets: DashMap<u32, String>,
    next_handle: AtomicU32,
    env_path: Option<PathBuf>,
}

impl EnvSecretsManager {
    pub fn new(dotenv_dir: Option<PathBuf>) -> Arc<Self> {
        let env_path = dotenv_dir.map(|dir| dir.join(".env"));
        let mgr = Arc::new(Self {
            handles: DashMap::new(),
            secrets: DashMap::new(),
            next_handle: AtomicU32::new(1),
            env_path: env_path.clone(),
        });

        match &env_path {
            Some(path) => mgr.load_dotenv(path),
            None => info!("no secrets directory given, secrets are in-memory only"),
        }
        mgr
    }

    fn insert(&self, key: &str, secret: &str) {
        let handle = *self
            .handles
            .entry(key.to_string())
            .or_insert_with(|| self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.secrets.insert(handle, secret.to_string());
    }

    fn load_dotenv(&self, path: &Path) {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((k, v)) => self.insert(&k, &v),
                        Err(e) => error!("Malformed line in {}: {}", path.display(), e),
                    }
                }
                info!("secrets loaded from {}", path.display());
            }
            Err(DotenvError::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => {
                info!(".env file {} not found, skipping", path.display());
            }
            Err(e) => error!("Failed to read {}: {}", path.display(), e),
        }
    }

    fn write_dotenv(&self) -> Result<(), SecretsError> {
        let Some(path) = &self.env_path else {
            return Ok(());
        };

        let mut lines = self
            .handles
            .iter()
            .filter_map(|kv| {
                self.secrets
                    .get(kv.value())
                    .map(|v| format!("{}={}", kv.key(), v.replace('\n', "\\n")))
            })
            .collect::<Vec<_>>();
        lines.sort();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SecretsError::Io(e.to_string()))?;
        }
        std::fs::write(path, lines.join("\n") + "\n").map_err(|e| {
            error!("Failed to write to .env file {}: {}", path.display(), e);
            SecretsError::Io(e.to_string())
        })
    }
}

#[async_trait]
impl SecretsManagerType for EnvSecretsManager {
    fn get(&self, key: &str) -> Option<u32> {
        self.handles.get(key).map(|h| *h)
    }

    fn keys(&self) -> Vec<String> {
        self.handles.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.insert(key, secret);
        self.write_dotenv()
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        let (_, handle) = self.handles.remove(key).ok_or(SecretsError::NotFound)?;
        self.secrets.remove(&handle);
        self.write_dotenv()
    }

    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError> {
        Ok(self.secrets.get(&handle).map(|s| s.clone()))
    }

    fn name(&self) -> &'static str {
        "EnvSecrets"
    }
}

/// In-memory secrets, mostly for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemorySecretsManager {
    handles: DashMap<String, u32>,
    secrets: DashMap<u32, String>,
    next_handle: AtomicU32,
}

impl MemorySecretsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SecretsManagerType for MemorySecretsManager {
    fn get(&self, key: &str) -> Option<u32> {
        self.handles.get(key).map(|h| *h)
    }

    fn keys(&self) -> Vec<String> {
        self.handles.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        let handle = *self
            .handles
            .entry(key.to_string())
            .or_insert_with(|| self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.secrets.insert(handle, secret.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        let (_, handle) = self.handles.remove(key).ok_or(SecretsError::NotFound)?;
        self.secrets.remove(&handle);
        Ok(())
    }

    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError> {
        Ok(self.secrets.get(&handle).map(|s| s.clone()))
    }

    fn name(&self) -> &'static str {
        "MemorySecrets"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn credential_keys_are_env_safe() {
        let (user, password) = credential_keys("a1b2.c3-d");
        assert_eq!(user, "DISPATCH_A1B2_C3_D_USER");
        assert_eq!(password, "DISPATCH_A1B2_C3_D_PASSWORD");
    }

    #[tokio::test]
    async fn memory_manager_roundtrip() {
        let mgr = SecretsManager(MemorySecretsManager::new());
        assert_eq!(mgr.get_secret("k").await.unwrap(), None);

        mgr.add_secret("k", "v1").await.unwrap();
        mgr.add_secret("k", "v2").await.unwrap();
        assert_eq!(mgr.get_secret("k").await.unwrap(), Some("v2".into()));

        mgr.delete_secret("k").await.unwrap();
        assert_eq!(mgr.get_secret("k").await.unwrap(), None);
        assert_eq!(mgr.delete_secret("k").await, Err(SecretsError::NotFound));
    }

    #[tokio::test]
    async fn credentials_are_looked_up_per_node() {
        let mgr = SecretsManager(MemorySecretsManager::new());
        mgr.add_secret("DISPATCH_N1_USER", "admin").await.unwrap();
        mgr.add_secret("DISPATCH_N1_PASSWORD", "pw").await.unwrap();

        let creds = mgr.credentials_for("n1").await.unwrap();
        assert_eq!(creds, Credentials::new("admin", "pw"));

        let none = mgr.credentials_for("n2").await.unwrap();
        assert_eq!(none, Credentials::default());
    }

    #[tokio::test]
    async fn env_manager_loads_and_persists() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "DISPATCH_N1_USER=admin\n").unwrap();

        let mgr = SecretsManager(EnvSecretsManager::new(Some(dir.path().to_path_buf())));
        assert_eq!(mgr.get_secret("DISPATCH_N1_USER").await.unwrap(), Some("admin".into()));

        mgr.add_secret("DISPATCH_N1_PASSWORD", "pw").await.unwrap();
        let written = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(written.contains("DISPATCH_N1_PASSWORD=pw"));
        assert!(written.contains("DISPATCH_N1_USER=admin"));
    }

    #[tokio::test]
    async fn env_manager_without_file_starts_empty() {
        let dir = tempdir().unwrap();
        let mgr = EnvSecretsManager::new(Some(dir.path().join("missing")));
        assert!(mgr.keys().is_empty());
    }
}
