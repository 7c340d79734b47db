//! Configuration system for the Switchyard transport.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization. Transport tuning values are clamped to the safe
//! ranges both ends of a connection agree on.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, IDLE_SLEEP_MS_RANGE, MAX_MESSAGE_SIZE_RANGE, NetConfig, ServerConfig,
    TRAIN_BOARDING_MS_RANGE, default_config_dir,
};
pub use error::ConfigError;
