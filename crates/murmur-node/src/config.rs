//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use murmur_shared::constants::{CHANNEL_LOAD_TIMEOUT_MS, CORE_LOAD_TIMEOUT_MS, DEFAULT_DATA_PORT};
use murmur_store::StorageOptions;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for community replicas.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory, or `./murmur-data`.
    pub data_dir: PathBuf,

    /// Community served by this node.
    /// Env: `COMMUNITY_ID`
    /// Default: `default`
    pub community_id: String,

    /// Socket address of the data socket (HTTP + WebSocket).
    /// Env: `HTTP_ADDR`
    /// Default: `127.0.0.1:4677`
    pub http_addr: SocketAddr,

    /// PEM file holding the community root certificate.
    /// Env: `ROOT_CERT_PATH`
    pub root_cert_path: Option<PathBuf>,

    /// Env: `CORE_LOAD_TIMEOUT_MS`
    pub core_load_timeout: Duration,

    /// Env: `CHANNEL_LOAD_TIMEOUT_MS`
    pub channel_load_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            community_id: "default".to_string(),
            http_addr: ([127, 0, 0, 1], DEFAULT_DATA_PORT).into(),
            root_cert_path: None,
            core_load_timeout: Duration::from_millis(CORE_LOAD_TIMEOUT_MS),
            channel_load_timeout: Duration::from_millis(CHANNEL_LOAD_TIMEOUT_MS),
        }
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "murmur", "murmur")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./murmur-data"))
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(id) = lookup("COMMUNITY_ID") {
            if is_safe_component(&id) {
                config.community_id = id;
            } else {
                tracing::warn!(value = %id, "Invalid COMMUNITY_ID, using default");
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("ROOT_CERT_PATH") {
            if !path.is_empty() {
                config.root_cert_path = Some(PathBuf::from(path));
            }
        }

        if let Some(ms) = lookup("CORE_LOAD_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.core_load_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %ms, "Invalid CORE_LOAD_TIMEOUT_MS, using default"),
            }
        }

        if let Some(ms) = lookup("CHANNEL_LOAD_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.channel_load_timeout = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %ms, "Invalid CHANNEL_LOAD_TIMEOUT_MS, using default")
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Directory holding this community's replica.
    pub fn community_dir(&self) -> PathBuf {
        self.data_dir.join(&self.community_id)
    }

    /// Storage options for the configured community.
    pub fn storage_options(&self) -> anyhow::Result<StorageOptions> {
        let root_certificate = match &self.root_cert_path {
            Some(path) => Some(read_root_certificate(path)?),
            None => None,
        };
        Ok(StorageOptions {
            data_dir: Some(self.community_dir()),
            create_paths: true,
            core_load_timeout: self.core_load_timeout,
            channel_load_timeout: self.channel_load_timeout,
            root_certificate,
        })
    }
}

fn read_root_certificate(path: &Path) -> anyhow::Result<String> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read root certificate {}: {e}", path.display()))?;
    let pem = pem.trim();
    if pem.is_empty() {
        anyhow::bail!("root certificate {} is empty", path.display());
    }
    Ok(pem.to_string())
}

/// A single path component: no separators, no dot segments.
fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
