//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config directory: the platform config base joined with
/// `switchyard` (e.g. `~/.config/switchyard` on Linux).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("switchyard"))
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport tuning shared with every peer out of band.
    pub net: NetConfig,
    /// Listener settings.
    pub server: ServerConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport tuning. These values must match the peer implementation; they
/// are agreed out of band, not negotiated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    /// Payload size ceiling in bytes. Clamped to [512, 6144].
    pub max_message_size: u16,
    /// Boarding window before a partially-filled train is flushed, in
    /// milliseconds. Clamped to [100, 1000].
    pub train_boarding_time_ms: u64,
    /// Idle pacing for the host loop, in milliseconds. Clamped to [5, 500].
    pub idle_sleep_ms: u64,
    /// Disconnect peers whose messages leave unread trailing bytes.
    pub strict_payload_checks: bool,
    /// Depth of the transport event queue.
    pub event_queue_depth: usize,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to bind to.
    pub bind_port: u16,
    /// Maximum concurrent connections.
    pub max_connections: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4096,
            train_boarding_time_ms: 500,
            idle_sleep_ms: 15,
            strict_payload_checks: false,
            event_queue_depth: 1024,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 7777,
            max_connections: 256,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Clamping and derived values ---

/// Allowed range for [`NetConfig::max_message_size`].
pub const MAX_MESSAGE_SIZE_RANGE: (u16, u16) = (512, 6144);

/// Allowed range for [`NetConfig::train_boarding_time_ms`].
pub const TRAIN_BOARDING_MS_RANGE: (u64, u64) = (100, 1000);

/// Allowed range for [`NetConfig::idle_sleep_ms`].
pub const IDLE_SLEEP_MS_RANGE: (u64, u64) = (5, 500);

impl NetConfig {
    /// Return a copy with every tuning value clamped to its safe range,
    /// logging each adjustment.
    pub fn clamped(&self) -> Self {
        let mut out = self.clone();
        out.max_message_size = clamp_logged(
            "max_message_size",
            self.max_message_size,
            MAX_MESSAGE_SIZE_RANGE.0,
            MAX_MESSAGE_SIZE_RANGE.1,
        );
        out.train_boarding_time_ms = clamp_logged(
            "train_boarding_time_ms",
            self.train_boarding_time_ms,
            TRAIN_BOARDING_MS_RANGE.0,
            TRAIN_BOARDING_MS_RANGE.1,
        );
        out.idle_sleep_ms = clamp_logged(
            "idle_sleep_ms",
            self.idle_sleep_ms,
            IDLE_SLEEP_MS_RANGE.0,
            IDLE_SLEEP_MS_RANGE.1,
        );
        out
    }

    /// Train buffer capacity: six maximum-size messages.
    pub fn train_capacity(&self) -> usize {
        usize::from(self.max_message_size) * 6
    }

    /// Train flush threshold: four maximum-size messages.
    pub fn train_threshold(&self) -> usize {
        usize::from(self.max_message_size) * 4
    }
}

fn clamp_logged<T: Ord + Copy + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> T {
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::info!("{name} {value} out of range, clamped to {clamped}");
    }
    clamped
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
