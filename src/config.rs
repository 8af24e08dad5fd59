use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::prune::{PassThroughRename, PruneMode};
use crate::transport::{TlsPolicy, normalize_host};

pub const IS_DEVEL_KEY: &str = "DISPATCH_IS_DEVEL";
pub const LOCAL_URL_KEY: &str = "DISPATCH_LOCAL_URL";
pub const ADMIN_ADDR_KEY: &str = "DISPATCH_ADMIN_ADDR";

pub const DEFAULT_LOCAL_URL: &str = "localhost:1880";
pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:1881";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("dispatcher `{id}`: {message}")]
    Invalid { id: String, message: String },
}

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.0.set(key, value).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file when one exists.
/// Values set at runtime shadow the environment without touching it.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    overrides: DashMap<String, String>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not load .env from {}: {}", env_file.display(), e),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self {
            env_file,
            overrides: DashMap::new(),
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys = env::vars().map(|(k, _)| k).collect::<HashSet<_>>();
        keys.extend(self.overrides.iter().map(|kv| kv.key().clone()));
        keys.into_iter().collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .map(|v| v.clone())
            .or_else(|| env::var(key).ok())
    }

    async fn set(&self, key: &str, value: &str) {
        self.overrides.insert(key.to_string(), value.to_string());
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} keys)", self.map.len())
    }
}

/// Process-wide settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Development mode: self-signed certificates are accepted per request.
    pub is_devel: bool,
    /// Address of the local runtime, used as the source and relay host.
    pub local_url: String,
    pub admin_addr: SocketAddr,
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Self, SettingsError> {
        let is_devel = match config.get(IS_DEVEL_KEY).await {
            Some(raw) => parse_bool(IS_DEVEL_KEY, &raw)?,
            None => true,
        };
        let local_url = config
            .get(LOCAL_URL_KEY)
            .await
            .map(|raw| normalize_host(&raw))
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_URL.to_string());
        let raw_addr = config
            .get(ADMIN_ADDR_KEY)
            .await
            .unwrap_or_else(|| DEFAULT_ADMIN_ADDR.to_string());
        let admin_addr: SocketAddr = raw_addr
            .trim()
            .parse()
            .map_err(|_| SettingsError::InvalidValue {
                key: ADMIN_ADDR_KEY.to_string(),
                value: raw_addr.clone(),
            })?;

        Ok(Self {
            is_devel,
            local_url,
            admin_addr,
        })
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        if self.is_devel {
            TlsPolicy::AcceptInvalidCerts
        } else {
            TlsPolicy::Verify
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_devel: true,
            local_url: DEFAULT_LOCAL_URL.to_string(),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 1881)),
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, SettingsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// One configured sheet dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DispatcherConfig {
    /// Node id; also the relay path on the local runtime.
    pub id: String,
    /// Label of the tab to dispatch.
    pub sheet: String,
    /// Source runtime; falls back to `DISPATCH_LOCAL_URL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_url: Option<String>,
    /// Destination runtime.
    pub dest_url: String,
    /// Retry with an admin token when a runtime answers 400/401.
    #[serde(default)]
    pub auth: bool,
    /// Dispatch once shortly after start-up.
    #[serde(default)]
    pub once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<PassThroughRename>,
    /// `relay` rewires the delegates, `plain` copies the sheet as is.
    #[serde(default)]
    pub mode: PruneMode,
}

impl DispatcherConfig {
    pub fn new(id: impl Into<String>, sheet: impl Into<String>, dest_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sheet: sheet.into(),
            local_url: None,
            dest_url: dest_url.into(),
            auth: false,
            once: false,
            rename: None,
            mode: PruneMode::default(),
        }
    }

    pub fn source_host(&self, settings: &Settings) -> String {
        self.local_url
            .as_deref()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| settings.local_url.clone())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |message: &str| SettingsError::Invalid {
            id: self.id.clone(),
            message: message.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.sheet.is_empty() {
            return Err(invalid("sheet must not be empty"));
        }
        if let Some(rename) = &self.rename {
            rename.validate().map_err(|m| invalid(&m))?;
        }
        let dest = normalize_host(&self.dest_url);
        if dest.is_empty() {
            return Err(invalid("dest_url must not be empty"));
        }
        match Url::parse(&format!("http://{dest}")) {
            Ok(url) if url.host_str().is_some() => Ok(()),
            _ => Err(invalid(&format!("dest_url `{}` is not a host[:port]", self.dest_url))),
        }
    }
}

/// Top level of `dispatchers.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DispatchersFile {
    #[serde(default)]
    pub dispatchers: Vec<DispatcherConfig>,
}

impl DispatchersFile {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::from_yaml(&contents).map_err(|e| match e {
            SettingsError::Parse { message, .. } => SettingsError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        info!(path = %path.display(), count = file.dispatchers.len(), "dispatchers loaded");
        Ok(file)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, SettingsError> {
        let file: DispatchersFile =
            serde_yaml_bw::from_str(contents).map_err(|e| SettingsError::Parse {
                path: PathBuf::from("<inline>"),
                message: e.to_string(),
            })?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let mut seen = HashSet::new();
        for d in &self.dispatchers {
            d.validate()?;
            if !seen.insert(d.id.as_str()) {
                return Err(SettingsError::Invalid {
                    id: d.id.clone(),
                    message: "duplicate id".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DispatcherConfig> {
        self.dispatchers.iter().find(|d| d.id == id)
    }

    /// JSON schema of the dispatchers file.
    pub fn schema() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&schema_for!(DispatchersFile))
    }
}
