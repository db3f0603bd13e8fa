//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Ingestion server commands.
#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    /// Run the ingestion server and realtime channel
    Run {
        /// Address to listen on (overrides `server.bind`)
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Sign a device credential with the configured secret
    MintToken(MintTokenArgs),
}

/// Arguments for `server mint-token`.
#[derive(Debug, Args)]
pub struct MintTokenArgs {
    /// Device the credential is bound to
    #[arg(long)]
    pub device_id: String,

    /// Display name embedded in the credential
    #[arg(long)]
    pub user_name: Option<String>,

    /// Device label embedded in the credential
    #[arg(long)]
    pub title: Option<String>,

    /// Lifetime of the credential in hours
    #[arg(long, default_value = "8760")]
    pub ttl_hours: i64,
}

/// Device runtime commands.
#[derive(Debug, Subcommand)]
pub enum DeviceCommand {
    /// Run the device pipeline over a stream of position fixes
    Run {
        /// JSON-lines file of fixes (reads stdin when omitted)
        #[arg(short, long, value_name = "FILE")]
        fixes: Option<PathBuf>,
    },

    /// Deliver everything in the offline queue once
    Drain,
}

/// Offline queue commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show queue depth and age
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List pending records, oldest first
    List {
        /// Maximum number of records
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete every pending record
    Clear {
        /// Confirm deletion
        #[arg(short, long)]
        yes: bool,
    },
}

/// Viewer commands.
#[derive(Debug, Subcommand)]
pub enum ViewerCommand {
    /// Follow the realtime channel and print liveness events
    Watch {
        /// Realtime endpoint (overrides `viewer.hub_url`)
        #[arg(short, long, value_name = "URL")]
        url: Option<String>,

        /// Start empty instead of restoring the saved device state
        #[arg(long)]
        fresh: bool,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Configuration file to validate (defaults to the standard path)
        file: Option<PathBuf>,
    },
}
