//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Switchyard server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "switchyard", about = "Switchyard transport server")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Payload size ceiling in bytes.
    #[arg(long)]
    pub max_message_size: Option<u16>,

    /// Train boarding window in milliseconds.
    #[arg(long)]
    pub boarding_ms: Option<u64>,

    /// Disconnect peers on unread trailing payload bytes.
    #[arg(long)]
    pub strict: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.bind {
            self.server.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.server.bind_port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(size) = args.max_message_size {
            self.net.max_message_size = size;
        }
        if let Some(ms) = args.boarding_ms {
            self.net.train_boarding_time_ms = ms;
        }
        if let Some(strict) = args.strict {
            self.net.strict_payload_checks = strict;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_args() -> CliArgs {
        CliArgs {
            bind: None,
            port: None,
            max_connections: None,
            max_message_size: None,
            boarding_ms: None,
            strict: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            bind: Some("192.168.1.1".to_string()),
            max_message_size: Some(2048),
            ..no_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.bind_address, "192.168.1.1");
        assert_eq!(config.net.max_message_size, 2048);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.bind_port, 7777);
        assert_eq!(config.net.train_boarding_time_ms, 500);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&no_args());
        assert_eq!(config, original);
    }
}
