//! Configuration management for trackline.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults. One
//! file configures all three roles; each process reads only its own section
//! plus `delivery` on the device side.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::DeviceIdentity;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "trackline";

/// Default device queue file name.
const QUEUE_FILE_NAME: &str = "queue.db";

/// Default server database file name.
const TELEMETRY_FILE_NAME: &str = "telemetry.db";

/// Default viewer snapshot file name.
const VIEWER_STATE_FILE_NAME: &str = "viewer_state.json";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "TRACKLINE_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `TRACKLINE_`, sections split by `__`)
/// 2. TOML config file at `~/.config/trackline/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device runtime configuration.
    pub device: DeviceConfig,
    /// Retry, backoff and drain scheduling.
    pub delivery: DeliveryConfig,
    /// Ingestion server configuration.
    pub server: ServerConfig,
    /// Live viewer configuration.
    pub viewer: ViewerConfig,
}

/// Device-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier. Must match the credential's `deviceId` claim.
    pub device_id: Option<String>,
    /// Display name of the carrier.
    pub user_name: Option<String>,
    /// Free-form device label.
    pub title: Option<String>,
    /// Base URL of the ingestion server.
    pub server_url: String,
    /// Bearer credential issued during activation.
    pub credential: Option<String>,
    /// Path to the offline queue database.
    /// Defaults to `~/.local/share/trackline/queue.db`
    pub queue_path: Option<PathBuf>,
    /// Minimum movement before a fix is transmitted, in meters.
    pub min_distance_m: f64,
    /// Multiplier applied to the fix accuracy radius.
    pub accuracy_factor: f64,
    /// Capacity of the hand-off channel between capture and send lanes.
    pub send_buffer: usize,
}

/// Delivery-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per record before giving up.
    pub max_attempts: u32,
    /// Base backoff for live sends in milliseconds.
    pub live_backoff_ms: u64,
    /// Base backoff for queue drains in milliseconds.
    pub drain_backoff_ms: u64,
    /// Pause between records during a drain in milliseconds.
    pub throttle_ms: u64,
    /// Interval of the periodic drain in seconds.
    pub drain_interval_secs: u64,
    /// Delay before the first periodic drain in seconds.
    pub drain_initial_delay_secs: u64,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Server-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind: String,
    /// Path to the telemetry database.
    /// Defaults to `~/.local/share/trackline/telemetry.db`
    pub database_path: Option<PathBuf>,
    /// HS256 secret used to verify device credentials.
    pub token_secret: Option<String>,
    /// Capacity of the realtime broadcast buffer.
    pub broadcast_capacity: usize,
}

/// Viewer-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// WebSocket URL of the realtime hub.
    pub hub_url: String,
    /// Liveness re-evaluation interval in seconds.
    pub tick_interval_secs: u64,
    /// Age at which a device becomes Paused.
    pub paused_after_secs: u64,
    /// Age at which a device becomes Disconnected.
    pub disconnected_after_secs: u64,
    /// Age at which a device is evicted.
    pub removed_after_secs: u64,
    /// Maximum trail points kept per device.
    pub trail_capacity: usize,
    /// Debounce for routine viewport fits in milliseconds.
    pub fit_debounce_ms: u64,
    /// Largest accepted difference between a broadcast timestamp and the viewer clock.
    pub max_clock_skew_secs: u64,
    /// Keep device state and visibility across restarts.
    pub persist_state: bool,
    /// Path to the viewer snapshot.
    /// Defaults to `~/.local/share/trackline/viewer_state.json`
    pub snapshot_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            user_name: None,
            title: None,
            server_url: "http://127.0.0.1:3000".to_string(),
            credential: None,
            queue_path: None, // Will be resolved to default at runtime
            min_distance_m: 20.0,
            accuracy_factor: 2.0,
            send_buffer: 64,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            live_backoff_ms: 1_500,
            drain_backoff_ms: 2_000,
            throttle_ms: 500,
            drain_interval_secs: 15 * 60,
            drain_initial_delay_secs: 2 * 60,
            request_timeout_secs: 10,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            database_path: None,
            token_secret: None,
            broadcast_capacity: 256,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:3000/ws".to_string(),
            tick_interval_secs: 5,
            paused_after_secs: 60,
            disconnected_after_secs: 180,
            removed_after_secs: 240,
            trail_capacity: 500,
            fit_debounce_ms: 2_000,
            max_clock_skew_secs: 15,
            persist_state: true,
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `TRACKLINE_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        // Top-level tables are sections, not profiles.
        // `__` separates sections so keys like `server_url` stay intact.
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        // Device
        if !self.device.min_distance_m.is_finite() || self.device.min_distance_m < 0.0 {
            return Err(Error::invalid_config(format!(
                "min_distance_m must be a non-negative number, got {}",
                self.device.min_distance_m
            )));
        }
        if !self.device.accuracy_factor.is_finite() || self.device.accuracy_factor < 0.0 {
            return Err(Error::invalid_config(format!(
                "accuracy_factor must be a non-negative number, got {}",
                self.device.accuracy_factor
            )));
        }
        if self.device.send_buffer == 0 {
            return Err(Error::invalid_config("send_buffer must be greater than 0"));
        }

        // Delivery
        if self.delivery.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be greater than 0"));
        }
        if self.delivery.drain_interval_secs == 0 {
            return Err(Error::invalid_config(
                "drain_interval_secs must be greater than 0",
            ));
        }

        // Server
        if self.server.broadcast_capacity == 0 {
            return Err(Error::invalid_config(
                "broadcast_capacity must be greater than 0",
            ));
        }

        // Viewer
        if self.viewer.tick_interval_secs == 0 {
            return Err(Error::invalid_config(
                "tick_interval_secs must be greater than 0",
            ));
        }
        if self.viewer.trail_capacity == 0 {
            return Err(Error::invalid_config("trail_capacity must be greater than 0"));
        }
        let v = &self.viewer;
        if !(v.paused_after_secs < v.disconnected_after_secs
            && v.disconnected_after_secs < v.removed_after_secs)
        {
            return Err(Error::invalid_config(format!(
                "liveness thresholds must increase: paused ({}) < disconnected ({}) < removed ({})",
                v.paused_after_secs, v.disconnected_after_secs, v.removed_after_secs
            )));
        }
        // An accepted update must never land outside the realtime or paused band.
        if v.max_clock_skew_secs >= v.paused_after_secs {
            return Err(Error::invalid_config(format!(
                "max_clock_skew_secs ({}) must be smaller than paused_after_secs ({})",
                v.max_clock_skew_secs, v.paused_after_secs
            )));
        }

        Ok(())
    }

    /// Resolve the device identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityMissing`] naming the first unset or blank field.
    pub fn identity(&self) -> Result<DeviceIdentity> {
        fn required(value: Option<&String>, field: &'static str) -> Result<String> {
            value
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(Error::IdentityMissing { field })
        }

        Ok(DeviceIdentity {
            device_id: required(self.device.device_id.as_ref(), "device_id")?,
            user_name: required(self.device.user_name.as_ref(), "user_name")?,
            title: required(self.device.title.as_ref(), "title")?,
        })
    }

    /// Get the offline queue path, resolving defaults if not set.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.device
            .queue_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(QUEUE_FILE_NAME))
    }

    /// Get the telemetry database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.server
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(TELEMETRY_FILE_NAME))
    }

    /// Get the viewer snapshot path, or `None` when persistence is off.
    #[must_use]
    pub fn viewer_snapshot_path(&self) -> Option<PathBuf> {
        self.viewer.persist_state.then(|| {
            self.viewer
                .snapshot_path
                .clone()
                .unwrap_or_else(|| Self::default_data_dir().join(VIEWER_STATE_FILE_NAME))
        })
    }

    /// Get the credential signing secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SecretMissing`] if no non-empty secret is configured.
    pub fn token_secret(&self) -> Result<&str> {
        self.server
            .token_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(Error::SecretMissing)
    }

    /// Get the live send backoff base as a Duration.
    #[must_use]
    pub fn live_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery.live_backoff_ms)
    }

    /// Get the drain backoff base as a Duration.
    #[must_use]
    pub fn drain_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery.drain_backoff_ms)
    }

    /// Get the inter-record drain throttle as a Duration.
    #[must_use]
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.delivery.throttle_ms)
    }

    /// Get the periodic drain interval as a Duration.
    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.delivery.drain_interval_secs)
    }

    /// Get the delay before the first periodic drain as a Duration.
    #[must_use]
    pub fn drain_initial_delay(&self) -> Duration {
        Duration::from_secs(self.delivery.drain_initial_delay_secs)
    }

    /// Get the HTTP request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.request_timeout_secs)
    }

    /// Get the viewer tick interval as a Duration.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.viewer.tick_interval_secs)
    }

    /// Get the viewport fit debounce as a Duration.
    #[must_use]
    pub fn fit_debounce(&self) -> Duration {
        Duration::from_millis(self.viewer.fit_debounce_ms)
    }

    /// Get the viewer clock-skew gate as a Duration.
    #[must_use]
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.viewer.max_clock_skew_secs)
    }
}
