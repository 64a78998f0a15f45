//! CLI interface and argument parsing
//!
//! The command-line surface for the replicator. Argument parsing itself is
//! thin; every option lands in the typed configuration record before any
//! component sees it.

pub mod commands;

use clap::{Parser, Subcommand};

/// Underpass - OSM replication into PostGIS
#[derive(Parser, Debug)]
#[command(name = "underpass")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "UNDERPASS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log to stdout only instead of underpass.log
    #[arg(short = 'o', long)]
    pub logstdout: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Monitor the planet server and replicate into the database
    Monitor(commands::monitor::MonitorArgs),

    /// Validate the configuration and print the resolved values
    ValidateConfig(commands::validate::ValidateArgs),

    /// Show replication cursors and recent failures
    Status(commands::status::StatusArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_monitor() {
        let cli = Cli::parse_from(["underpass", "monitor"]);
        assert!(matches!(cli.command, Commands::Monitor(_)));
    }

    #[test]
    fn test_cli_parse_monitor_with_options() {
        let cli = Cli::parse_from([
            "underpass",
            "monitor",
            "--url",
            "000/075/000",
            "--frequency",
            "hourly",
            "--concurrency",
            "2",
        ]);
        let Commands::Monitor(args) = cli.command else {
            panic!("expected monitor command");
        };
        assert_eq!(args.url.as_deref(), Some("000/075/000"));
        assert_eq!(args.frequency.as_deref(), Some("hourly"));
        assert_eq!(args.concurrency, Some(2));
    }

    #[test]
    fn test_cli_parse_status() {
        let cli = Cli::parse_from(["underpass", "status"]);
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn test_cli_parse_log_level() {
        let cli = Cli::parse_from(["underpass", "--log-level", "debug", "validate-config"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
