//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DAYFLOW_USER_ID=u1                                                 │
//! │     DAYFLOW_REMOTE_URL=ws://relay.local:8787/ws                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/dayflow/sync.toml (Linux)                                │
//! │     ~/Library/Application Support/app.dayflow.dayflow/sync.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     user "user", 3 retry attempts, built-in collection catalog         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device id is normally not configured at all: it is read from (or
//! written to) the local store by [`crate::device::DeviceIdentity`].
//! `device.id` only pins it, which is useful for tests and kiosks.
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [user]
//! id = "u1"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 2000
//! max_backoff_ms = 8000
//!
//! [remote]
//! url = "ws://127.0.0.1:8787/ws"
//!
//! [[collections]]
//! name = "dailyData"
//! granularity = { kind = "keyed", lookback_days = 7 }
//! policy = { kind = "merge_rows", field = "tasks" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use dayflow_core::paths::validate_segment;
use dayflow_core::{ConflictPolicy, DEFAULT_USER_ID, SYSTEM_COLLECTION};

use crate::error::{SyncError, SyncResult};

/// Local key under which singleton collections keep their one record.
pub const SINGLETON_KEY: &str = "root";

// =============================================================================
// Collection Catalog
// =============================================================================

/// How a collection maps onto remote paths.
///
/// ```text
/// Keyed      local (dailyData, 2024-06-01) ↔ users/{u}/dailyData/2024-06-01
/// Singleton  local (gameState, root)       ↔ users/{u}/gameState
/// Items      local (templates, tpl-1)      ↔ users/{u}/templates/tpl-1
/// ```
///
/// `Keyed` and `Items` share a layout; `Items` rows are pushed through
/// [`crate::item_sync::ItemSync`] and are never range-limited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Granularity {
    /// One envelope per key. `lookback_days` limits listening to recent keys.
    Keyed {
        #[serde(default)]
        lookback_days: Option<u32>,
    },

    /// One envelope for the whole collection.
    #[default]
    Singleton,

    /// One envelope per row id.
    Items,
}

/// One synchronized collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name, used both locally and as the remote path segment.
    pub name: String,

    #[serde(default)]
    pub granularity: Granularity,

    /// Conflict policy applied to inbound changes.
    #[serde(default)]
    pub policy: ConflictPolicy,

    /// Push only the last change per key within this window.
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl CollectionSpec {
    /// Keyed collection with LWW.
    pub fn keyed(name: impl Into<String>) -> Self {
        CollectionSpec {
            name: name.into(),
            granularity: Granularity::Keyed { lookback_days: None },
            policy: ConflictPolicy::Lww,
            debounce_ms: None,
        }
    }

    /// Singleton collection with LWW.
    pub fn singleton(name: impl Into<String>) -> Self {
        CollectionSpec {
            name: name.into(),
            granularity: Granularity::Singleton,
            policy: ConflictPolicy::Lww,
            debounce_ms: None,
        }
    }

    /// Item collection with LWW.
    pub fn items(name: impl Into<String>) -> Self {
        CollectionSpec {
            name: name.into(),
            granularity: Granularity::Items,
            policy: ConflictPolicy::Lww,
            debounce_ms: None,
        }
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Limits listening to keys from the last `days` days.
    pub fn with_lookback(mut self, days: u32) -> Self {
        if let Granularity::Keyed { lookback_days } = &mut self.granularity {
            *lookback_days = Some(days);
        }
        self
    }

    /// Sets a push debounce window.
    pub fn with_debounce(mut self, millis: u64) -> Self {
        self.debounce_ms = Some(millis);
        self
    }

    /// Lookback window, for keyed collections that have one.
    pub fn lookback_days(&self) -> Option<u32> {
        match self.granularity {
            Granularity::Keyed { lookback_days } => lookback_days,
            _ => None,
        }
    }

    /// Debounce window as a duration.
    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// The collections Dayflow synchronizes out of the box.
pub fn default_collections() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::keyed("dailyData")
            .with_lookback(7)
            .with_policy(ConflictPolicy::MergeRows {
                field: Some("tasks".into()),
            }),
        CollectionSpec::singleton("gameState").with_policy(ConflictPolicy::MergeProgress),
        CollectionSpec::items("templates"),
        CollectionSpec::items("globalInbox"),
        CollectionSpec::items("shopItems"),
        CollectionSpec::keyed("energyLevels").with_lookback(7),
        CollectionSpec::keyed("chatHistory")
            .with_lookback(7)
            .with_debounce(1000),
        CollectionSpec::keyed("tokenUsage").with_debounce(2000),
    ]
}

// =============================================================================
// Sections
// =============================================================================

/// Device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Pinned device id. `None` means "load or create from the local store".
    #[serde(default)]
    pub id: Option<String>,
}

/// Remote user namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    /// User id for `users/{id}/...` paths.
    #[serde(default = "default_user_id")]
    pub id: String,
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

impl Default for UserSettings {
    fn default() -> Self {
        UserSettings {
            id: default_user_id(),
        }
    }
}

/// Retry queue behaviour.
///
/// ```text
/// attempt 1 fails ──► wait 2s ──► attempt 2 fails ──► wait 4s
///     ──► attempt 3 fails ──► parked, error callback { can_retry: true }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Automatic attempts before an entry is parked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay (milliseconds).
    #[serde(default = "default_retry_initial")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (milliseconds).
    #[serde(default = "default_retry_max")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// How often the queue looks for due entries (milliseconds).
    #[serde(default = "default_tick")]
    pub tick_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_initial() -> u64 {
    2_000
}
fn default_retry_max() -> u64 {
    8_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_tick() -> u64 {
    500
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_retry_initial(),
            max_backoff_ms: default_retry_max(),
            multiplier: default_multiplier(),
            tick_interval_ms: default_tick(),
        }
    }
}

impl RetrySettings {
    /// First backoff delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff ceiling.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Tick interval of the retry loop.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Inbound listener behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Window during which remote changes to the same entity are coalesced
    /// before being applied (milliseconds). Zero applies immediately.
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,
}

fn default_coalesce_window() -> u64 {
    50
}

impl Default for ListenerSettings {
    fn default() -> Self {
        ListenerSettings {
            coalesce_window_ms: default_coalesce_window(),
        }
    }
}

impl ListenerSettings {
    /// Coalesce window as a duration.
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Remote transport settings (used by [`crate::remote::WsRemote`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// WebSocket URL of the relay. `None` keeps the engine on an in-process remote.
    #[serde(default)]
    pub url: Option<String>,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Initial reconnect backoff (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum reconnect backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Keepalive ping interval (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    15
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            url: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// Diagnostics: sync log and remote metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationSettings {
    /// Per-path remote metrics. Defaults to on in debug builds only.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Sync log ring size.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Persist the sync log to `systemState/syncLogs`.
    #[serde(default = "default_true")]
    pub persist_log: bool,
}

fn default_metrics_enabled() -> bool {
    cfg!(debug_assertions)
}
fn default_log_capacity() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        InstrumentationSettings {
            metrics_enabled: default_metrics_enabled(),
            log_capacity: default_log_capacity(),
            persist_log: true,
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub user: UserSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub listener: ListenerSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub instrumentation: InstrumentationSettings,

    /// Collections kept in sync.
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionSpec>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            device: DeviceSettings::default(),
            user: UserSettings::default(),
            retry: RetrySettings::default(),
            listener: ListenerSettings::default(),
            remote: RemoteSettings::default(),
            instrumentation: InstrumentationSettings::default(),
            collections: default_collections(),
        }
    }
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref id) = self.device.id {
            if id.trim().is_empty() {
                return Err(SyncError::MissingDeviceId);
            }
        }

        validate_segment("user.id", &self.user.id)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if let Some(ref url) = self.remote.url {
            let parsed = url::Url::parse(url)?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote URL must start with ws:// or wss://, got: {}",
                    url
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(SyncError::InvalidConfig(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }

        if self.instrumentation.log_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "instrumentation.log_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.collections {
            validate_segment("collection", &spec.name)
                .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
            if spec.name == SYSTEM_COLLECTION {
                return Err(SyncError::InvalidConfig(format!(
                    "'{}' is reserved and cannot be synchronized",
                    SYSTEM_COLLECTION
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "collection '{}' is listed twice",
                    spec.name
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = var("DAYFLOW_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Some(id) = var("DAYFLOW_USER_ID") {
            debug!(user_id = %id, "Overriding user ID from environment");
            self.user.id = id;
        }

        if let Some(url) = var("DAYFLOW_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.url = Some(url);
        }

        if let Some(attempts) = var("DAYFLOW_MAX_RETRY_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid DAYFLOW_MAX_RETRY_ATTEMPTS"),
            }
        }

        if let Some(flag) = var("DAYFLOW_METRICS") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "on" => self.instrumentation.metrics_enabled = true,
                "0" | "false" | "off" => self.instrumentation.metrics_enabled = false,
                _ => warn!(value = %flag, "Unknown DAYFLOW_METRICS value"),
            }
        }

        if let Some(capacity) = var("DAYFLOW_LOG_CAPACITY") {
            if let Ok(n) = capacity.parse::<usize>() {
                self.instrumentation.log_capacity = n;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "dayflow", "dayflow")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the user ID.
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|spec| spec.name == name)
    }

    /// Returns the remote URL if configured.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.url.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.user_id(), "user");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff(), Duration::from_secs(2));
        assert_eq!(config.retry.max_backoff(), Duration::from_secs(8));
        assert_eq!(config.instrumentation.log_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_catalog() {
        let config = SyncConfig::default();
        let daily = config.collection("dailyData").unwrap();
        assert_eq!(daily.lookback_days(), Some(7));
        assert_eq!(
            daily.policy,
            ConflictPolicy::MergeRows {
                field: Some("tasks".into())
            }
        );

        let game = config.collection("gameState").unwrap();
        assert_eq!(game.granularity, Granularity::Singleton);
        assert_eq!(game.policy, ConflictPolicy::MergeProgress);

        assert_eq!(
            config.collection("chatHistory").unwrap().debounce(),
            Some(Duration::from_secs(1))
        );
        assert!(config.collection("templates").unwrap().lookback_days().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.user.id = "a.b".into();
        assert!(config.validate().unwrap_err().is_config_error());
        config.user.id = "u1".into();

        config.remote.url = Some("http://invalid".into());
        assert!(config.validate().is_err());
        config.remote.url = Some("ws://localhost:8787/ws".into());
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry.max_attempts = 3;

        config.collections.push(CollectionSpec::items("templates"));
        assert!(config.validate().is_err());
        config.collections.pop();

        config.collections.push(CollectionSpec::singleton(SYSTEM_COLLECTION));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DAYFLOW_USER_ID", "u42"),
            ("DAYFLOW_REMOTE_URL", "wss://relay.example/ws"),
            ("DAYFLOW_MAX_RETRY_ATTEMPTS", "5"),
            ("DAYFLOW_METRICS", "off"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.user_id(), "u42");
        assert_eq!(config.remote_url(), Some("wss://relay.example/ws"));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.instrumentation.metrics_enabled);
        assert!(config.device.id.is_none());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");

        let mut config = SyncConfig::default();
        config.user.id = "u7".into();
        config.collections = vec![CollectionSpec::keyed("dailyData").with_lookback(3)];
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[user]"));
        assert!(contents.contains("[[collections]]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.user_id(), "u7");
        assert_eq!(loaded.collections.len(), 1);
        assert_eq!(loaded.collections[0].lookback_days(), Some(3));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_str = r#"
            [user]
            id = "u1"

            [[collections]]
            name = "gameState"
            policy = { kind = "merge_progress" }
        "#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.collections.len(), 1);
        assert_eq!(config.collections[0].granularity, Granularity::Singleton);
        assert!(config.validate().is_ok());
    }
}
