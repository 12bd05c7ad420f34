//! Runtime configuration: room channels, timing policies and persistence endpoints.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

#[cfg(feature = "http-gateway")]
use crate::dao::gateway::http::HttpGatewayConfig;
use crate::platform::ChannelId;

/// Default location on disk where the core looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/roomkeeper.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "ROOMKEEPER_CONFIG_PATH";

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
/// Immutable runtime configuration shared across the core.
pub struct CoreConfig {
    /// Channel members join to get a fresh room.
    pub create_channel_id: ChannelId,
    /// Category new rooms are created in and reconciled from.
    pub room_category_id: ChannelId,
    /// Minimum delay between two room creations by the same member.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub creation_cooldown: Duration,
    /// Window inside which identical presence transitions are treated as duplicates.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dedup_ttl: Duration,
    /// Period of the reconciliation sweep.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconciliation_interval: Duration,
    /// Bounded wait for a session to be registered before a dependent write.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub confirmation_timeout: Duration,
    /// Sessions shorter than this are closed but left out of completed-session reports.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_session_duration: Duration,
    /// Fixed offset, in hours east of UTC, all timestamps are normalised to.
    pub utc_offset_hours: i8,
    /// Replication queue policy.
    pub writer: WriterSettings,
    /// Structural edit policy.
    pub mutator: MutatorSettings,
    /// Persistence endpoints.
    #[cfg(feature = "http-gateway")]
    pub gateway: GatewaySettings,
}

impl CoreConfig {
    /// Load the configuration from disk, falling back to the built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        create_channel = %config.create_channel_id,
                        "loaded room configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            create_channel_id: ChannelId::default(),
            room_category_id: ChannelId::default(),
            creation_cooldown: Duration::from_secs(60),
            dedup_ttl: Duration::from_secs(5),
            reconciliation_interval: Duration::from_secs(600),
            confirmation_timeout: Duration::from_secs(10),
            min_session_duration: Duration::from_secs(300),
            utc_offset_hours: 0,
            writer: WriterSettings::default(),
            mutator: MutatorSettings::default(),
            #[cfg(feature = "http-gateway")]
            gateway: GatewaySettings::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Policy of the deferred replicated writer.
pub struct WriterSettings {
    /// Sleep between ordered-queue passes when idle.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_interval: Duration,
    /// Attempts per secondary write before it is dropped.
    pub max_attempts: u32,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Policy of the rate-limited room mutator.
pub struct MutatorSettings {
    /// Bounded wait for a structural edit.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub edit_timeout: Duration,
    /// Renames the platform allows per room inside `rename_window`.
    pub renames_per_window: usize,
    /// Sliding window of the rename limit.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rename_window: Duration,
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            edit_timeout: Duration::from_secs(15),
            renames_per_window: 2,
            rename_window: Duration::from_secs(600),
        }
    }
}

#[cfg(feature = "http-gateway")]
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// REST endpoints: one primary source of truth and any number of replicas.
pub struct GatewaySettings {
    /// Primary store; `None` means [`HttpGatewayConfig::from_env`] is used.
    pub primary: Option<HttpGatewayConfig>,
    /// Write-only replicas kept eventually consistent.
    pub secondaries: Vec<HttpGatewayConfig>,
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
