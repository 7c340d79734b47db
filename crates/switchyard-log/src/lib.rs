//! Structured logging for the Switchyard transport.
//!
//! Provides structured, span-based, filterable logging via the `tracing`
//! ecosystem. Supports console output with timestamps and module paths, plus
//! JSON file logging in debug builds for post-mortem analysis. Integrates
//! with the configuration system for runtime log level control.

use std::path::Path;

use switchyard_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Sets up structured logging with:
/// - Console output with timestamps, module paths, and severity levels
/// - JSON file logging in debug builds (optional)
/// - Environment-based filtering (respects RUST_LOG)
/// - Integration with the config system's log_level setting
///
/// # Arguments
///
/// * `log_dir` - Optional directory for JSON log files (debug builds only)
/// * `debug_build` - Whether this is a debug build (enables file logging)
/// * `config` - Optional configuration to use for log level override
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = if let Some(config) = config
        && !config.debug.log_level.is_empty()
    {
        config.debug.log_level.clone()
    } else {
        "info".to_string()
    };

    // Base filter: config value by default, overridable via RUST_LOG
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    // In debug builds, also log to a file for post-mortem analysis
    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join("switchyard.log"))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Create an `EnvFilter` with the default filter string.
///
/// Enables `info` for all targets; useful for tests and for consistent
/// default behavior.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_enables_info() {
        let filter = default_env_filter();
        let filter_str = format!("{filter}");
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_module_filter_parses() {
        let filter = EnvFilter::new("info,switchyard_net=debug");
        let filter_str = format!("{filter}");
        assert!(filter_str.contains("switchyard_net=debug"));
    }

    #[test]
    fn test_config_log_level_wins_over_default() {
        let mut config = Config::default();
        config.debug.log_level = "warn".to_string();

        // Mirrors the selection logic in init_logging.
        let filter_str = if config.debug.log_level.is_empty() {
            "info".to_string()
        } else {
            config.debug.log_level.clone()
        };
        assert_eq!(filter_str, "warn");
    }

    #[test]
    fn test_log_file_created_in_debug_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::File::create(log_dir.join("switchyard.log")).unwrap();
        assert!(log_dir.join("switchyard.log").exists());
    }
}
