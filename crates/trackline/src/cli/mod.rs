//! Command-line interface for trackline.
//!
//! This module provides the CLI structure for the `trkl` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, DeviceCommand, MintTokenArgs, QueueCommand, ServerCommand, ViewerCommand,
};

/// trkl - Live location tracking
///
/// Runs the device pipeline, the ingestion server or a terminal viewer of the
/// realtime channel.
#[derive(Debug, Parser)]
#[command(name = "trkl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the ingestion server or mint credentials
    #[command(subcommand)]
    Server(ServerCommand),

    /// Run the device pipeline
    #[command(subcommand)]
    Device(DeviceCommand),

    /// Inspect the offline queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Watch live device status
    #[command(subcommand)]
    Viewer(ViewerCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Verbosity;
    use clap::CommandFactory;

    fn cli(verbose: u8, quiet: bool) -> Cli {
        Cli {
            config: None,
            verbose,
            quiet,
            command: Command::Config(ConfigCommand::Path),
        }
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "trkl");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(cli(0, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli(3, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli(0, false).verbosity(), Verbosity::Normal);
        assert_eq!(cli(1, false).verbosity(), Verbosity::Verbose);
        assert_eq!(cli(2, false).verbosity(), Verbosity::Trace);
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_server_run() {
        let cli = Cli::try_parse_from(["trkl", "server", "run", "--bind", "127.0.0.1:4000"]).unwrap();
        match cli.command {
            Command::Server(ServerCommand::Run { bind }) => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:4000"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mint_token() {
        let cli = Cli::try_parse_from([
            "trkl",
            "server",
            "mint-token",
            "--device-id",
            "dev-1",
            "--user-name",
            "alice",
            "--ttl-hours",
            "2",
        ])
        .unwrap();
        match cli.command {
            Command::Server(ServerCommand::MintToken(args)) => {
                assert_eq!(args.device_id, "dev-1");
                assert_eq!(args.user_name.as_deref(), Some("alice"));
                assert!(args.title.is_none());
                assert_eq!(args.ttl_hours, 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_mint_token_requires_device_id() {
        assert!(Cli::try_parse_from(["trkl", "server", "mint-token"]).is_err());
    }

    #[test]
    fn test_parse_device_run_with_fixes() {
        let cli = Cli::try_parse_from(["trkl", "device", "run", "--fixes", "fixes.jsonl"]).unwrap();
        match cli.command {
            Command::Device(DeviceCommand::Run { fixes }) => {
                assert_eq!(fixes, Some(PathBuf::from("fixes.jsonl")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_device_drain() {
        let cli = Cli::try_parse_from(["trkl", "device", "drain"]).unwrap();
        assert!(matches!(cli.command, Command::Device(DeviceCommand::Drain)));
    }

    #[test]
    fn test_parse_queue_commands() {
        let cli = Cli::try_parse_from(["trkl", "queue", "status", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Queue(QueueCommand::Status { json: true })
        ));

        let cli = Cli::try_parse_from(["trkl", "queue", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Queue(QueueCommand::List { limit: 20 })
        ));

        let cli = Cli::try_parse_from(["trkl", "queue", "clear"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Queue(QueueCommand::Clear { yes: false })
        ));
    }

    #[test]
    fn test_parse_viewer_watch() {
        let cli = Cli::try_parse_from(["trkl", "viewer", "watch", "--url", "ws://host/ws"]).unwrap();
        match cli.command {
            Command::Viewer(ViewerCommand::Watch { url, fresh }) => {
                assert_eq!(url.as_deref(), Some("ws://host/ws"));
                assert!(!fresh);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["trkl", "viewer", "watch", "--fresh"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Viewer(ViewerCommand::Watch { url: None, fresh: true })
        ));
    }

    #[test]
    fn test_parse_config_validate_positional() {
        let cli = Cli::try_parse_from(["trkl", "config", "validate", "/tmp/t.toml"]).unwrap();
        match cli.command {
            Command::Config(ConfigCommand::Validate { file }) => {
                assert_eq!(file, Some(PathBuf::from("/tmp/t.toml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["trkl", "queue", "status", "-c", "/custom/config.toml", "-vv"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_with_quiet() {
        let cli = Cli::try_parse_from(["trkl", "-q", "config", "path"]).unwrap();
        assert!(cli.quiet);
    }
}
