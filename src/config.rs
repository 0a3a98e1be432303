//! Configuration management for Dropgate Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const KILOBYTE: u64 = 1024;
const MEGABYTE: u64 = 1024 * KILOBYTE;
const GIGABYTE: u64 = 1024 * MEGABYTE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base of the share links handed to uploaders
    pub public_url: String,
    /// Concurrent HTTP requests before answering 503
    pub http_workers: usize,
    /// Concurrent background tasks (pumps, sessions, loops)
    pub background_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `<id>.bin` blobs
    pub data_dir: PathBuf,
    /// Snapshot of the metadata store
    pub snapshot_path: PathBuf,
    pub shards: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Upload size ceiling in bytes
    pub max_upload_bytes: u64,
    /// Largest single channel message
    pub max_message_bytes: usize,
    /// Requested TTLs above this mean "no expiry"
    pub max_ttl_secs: u64,
    /// Requested download limits above this mean "unlimited"
    pub max_download_limit: u32,
    /// Peer must answer a keepalive within this window
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    pub janitor_interval_secs: u64,
    pub snapshot_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                public_url: "http://localhost:3000".to_string(),
                http_workers: 10_000,
                background_workers: 32_768,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("data"),
                snapshot_path: PathBuf::from("config/data.json"),
                shards: crate::store::DEFAULT_SHARD_COUNT,
            },
            limits: LimitsConfig::default(),
            maintenance: MaintenanceConfig {
                janitor_interval_secs: 3600,
                snapshot_interval_secs: 600,
            },
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_upload_bytes: 10 * GIGABYTE,
            max_message_bytes: (10 * MEGABYTE) as usize,
            max_ttl_secs: 7 * 24 * 3600,
            max_download_limit: 300,
            pong_wait_secs: 60,
            write_wait_secs: 10,
        }
    }
}

impl LimitsConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keepalive interval, shorter than the pong wait
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
                public_url: env::var("PUBLIC_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.server.public_url),
                http_workers: parse_var("HTTP_WORKERS", defaults.server.http_workers),
                background_workers: parse_var(
                    "BACKGROUND_WORKERS",
                    defaults.server.background_workers,
                ),
            },
            storage: StorageConfig {
                data_dir: env::var("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.data_dir),
                snapshot_path: env::var("SNAPSHOT_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.snapshot_path),
                shards: parse_var("STORE_SHARDS", defaults.storage.shards),
            },
            limits: LimitsConfig {
                max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", defaults.limits.max_upload_bytes),
                max_message_bytes: parse_var(
                    "MAX_MESSAGE_BYTES",
                    defaults.limits.max_message_bytes,
                ),
                max_ttl_secs: parse_var("MAX_TTL_SECS", defaults.limits.max_ttl_secs),
                max_download_limit: parse_var(
                    "MAX_DOWNLOAD_LIMIT",
                    defaults.limits.max_download_limit,
                ),
                pong_wait_secs: parse_var("PONG_WAIT_SECS", defaults.limits.pong_wait_secs),
                write_wait_secs: parse_var("WRITE_WAIT_SECS", defaults.limits.write_wait_secs),
            },
            maintenance: MaintenanceConfig {
                janitor_interval_secs: parse_var(
                    "JANITOR_INTERVAL_SECS",
                    defaults.maintenance.janitor_interval_secs,
                ),
                snapshot_interval_secs: parse_var(
                    "SNAPSHOT_INTERVAL_SECS",
                    defaults.maintenance.snapshot_interval_secs,
                ),
            },
        })
    }
}

/// Read and parse an env var, keeping the default when unset or invalid
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}
