//! Configuration schema, defaults, and layered loading.
//!
//! Precedence: defaults < config file < environment < CLI
use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CHUNK_SIZE_BYTES: usize = 1024 * 1024;
pub const MAX_TOKEN_SIZE_BYTES: usize = 4096;
const MAX_SESSIONS: usize = 4096;

pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "dirdrop")
        .map(|p| p.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("dirdrop.toml"))
}

/// Frame sizes and the receive idle timeout. Both peers must agree on the sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Body frame size in bytes
    pub chunk_size: usize,
    /// Control/name frame size in bytes
    pub token_size: usize,
    /// Silence that ends a file body
    pub idle_timeout_ms: u64,
}

impl TransferSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            token_size: 128,
            idle_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub address: String,
    pub folder: PathBuf,
    pub max_sessions: usize,
    /// Wait between an entry name and its body
    pub pause_before_body_ms: u64,
    /// Wait after a body before the next entry name
    pub pause_after_body_ms: u64,
}

impl ServerSettings {
    pub fn pause_before_body(&self) -> Duration {
        Duration::from_millis(self.pause_before_body_ms)
    }

    pub fn pause_after_body(&self) -> Duration {
        Duration::from_millis(self.pause_after_body_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            folder: PathBuf::from("dataFileFolder"),
            max_sessions: 128,
            pause_before_body_ms: 1_000,
            pause_after_body_ms: 7_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub address: String,
    pub download_dir: PathBuf,
    /// How long an `all` request waits for the next entry name
    pub entry_wait_ms: u64,
}

impl ClientSettings {
    pub fn entry_wait(&self) -> Duration {
        Duration::from_millis(self.entry_wait_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            download_dir: PathBuf::from("."),
            entry_wait_ms: 10_000,
        }
    }
}

/// Fully resolved application configuration after all layers merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transfer: TransferSettings,
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl AppConfig {
    /// Rejects sizes out of range and pacing that would desynchronize the peers.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        ensure!(t.chunk_size > 0, "Invalid config: transfer.chunk_size must be > 0");
        ensure!(
            t.chunk_size <= MAX_CHUNK_SIZE_BYTES,
            "Invalid config: transfer.chunk_size must be <= {MAX_CHUNK_SIZE_BYTES}"
        );
        ensure!(t.token_size > 0, "Invalid config: transfer.token_size must be > 0");
        ensure!(
            t.token_size <= MAX_TOKEN_SIZE_BYTES,
            "Invalid config: transfer.token_size must be <= {MAX_TOKEN_SIZE_BYTES}"
        );
        ensure!(
            t.idle_timeout_ms > 0,
            "Invalid config: transfer.idle_timeout_ms must be > 0"
        );

        let s = &self.server;
        ensure!(
            s.max_sessions >= 1,
            "Invalid config: server.max_sessions must be >= 1"
        );
        ensure!(
            s.max_sessions <= MAX_SESSIONS,
            "Invalid config: server.max_sessions must be <= {MAX_SESSIONS}"
        );
        // body has to start before the client gives up on it
        ensure!(
            s.pause_before_body_ms < t.idle_timeout_ms,
            "Invalid config: server.pause_before_body_ms must be < transfer.idle_timeout_ms"
        );
        ensure!(
            s.pause_after_body_ms > t.idle_timeout_ms,
            "Invalid config: server.pause_after_body_ms must be > transfer.idle_timeout_ms"
        );

        // client has to still be listening when the next name shows up
        let gap = s.pause_after_body_ms - t.idle_timeout_ms;
        ensure!(
            self.client.entry_wait_ms > gap,
            "Invalid config: client.entry_wait_ms must be > {gap} (pause_after_body_ms - idle_timeout_ms)"
        );
        Ok(())
    }
}

/// Values given on the command line. `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub server_address: Option<String>,
    pub folder: Option<PathBuf>,
    pub max_sessions: Option<usize>,
    pub client_address: Option<String>,
    pub download_dir: Option<PathBuf>,
}

/// Loads config from defaults/file/env. `path` replaces the platform config path.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    load_from(Figment::new().merge(Toml::file(&path)))
}

fn load_from(file_layer: Figment) -> Result<AppConfig> {
    let config: AppConfig = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(file_layer)
        // DIRDROP_SERVER__MAX_SESSIONS=8 -> server.max_sessions
        .merge(Env::prefixed("DIRDROP_").split("__"))
        .extract()
        .context("Failed to load configuration")?;

    config.validate()?;
    Ok(config)
}

/// Applies CLI overrides to a loaded config and validates the result.
pub fn apply_overrides(mut config: AppConfig, overrides: &ConfigOverrides) -> Result<AppConfig> {
    if let Some(address) = &overrides.server_address {
        config.server.address = address.clone();
    }
    if let Some(folder) = &overrides.folder {
        config.server.folder = folder.clone();
    }
    if let Some(max) = overrides.max_sessions {
        config.server.max_sessions = max;
    }
    if let Some(address) = &overrides.client_address {
        config.client.address = address.clone();
    }
    if let Some(dir) = &overrides.download_dir {
        config.client.download_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}
