//! `trkl` - CLI for trackline
//!
//! This binary runs the device pipeline, the ingestion server and a terminal
//! viewer of the realtime channel.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use trackline::cli::{
    Cli, Command, ConfigCommand, DeviceCommand, MintTokenArgs, QueueCommand, ServerCommand,
    ViewerCommand,
};
use trackline::device::{
    ConnectivityMonitor, CredentialStore, DeliveryAgent, DeviceRuntime, DrainTrigger,
    HttpTransport, NoopPolicy, OfflineQueue, RuntimeSettings,
};
use trackline::server::{shutdown_signal, CredentialIssuer, TelemetryServer};
use trackline::viewer::{TrackerSettings, ViewerSession};
use trackline::{init_logging, Config, PositionFix};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validation reads its own file; everything else needs a loaded config
    if let Command::Config(ConfigCommand::Validate { file }) = cli.command {
        return handle_validate(file.or(cli.config));
    }

    let config = Config::load_from(cli.config.clone())
        .context("failed to load configuration")?;

    match cli.command {
        Command::Server(cmd) => handle_server(config, cmd).await,
        Command::Device(cmd) => handle_device(&config, cmd).await,
        Command::Queue(cmd) => handle_queue(&config, cmd),
        Command::Viewer(cmd) => handle_viewer(&config, cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

async fn handle_server(mut config: Config, cmd: ServerCommand) -> anyhow::Result<()> {
    match cmd {
        ServerCommand::Run { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let server = TelemetryServer::from_config(&config)?;
            info!(database = %config.database_path().display(), "Opened telemetry store");
            let listener = TelemetryServer::bind(&config.server.bind).await?;
            server.serve(listener, shutdown_signal()).await?;
        }
        ServerCommand::MintToken(args) => mint_token(&config, &args)?,
    }
    Ok(())
}

fn mint_token(config: &Config, args: &MintTokenArgs) -> anyhow::Result<()> {
    if args.ttl_hours <= 0 {
        bail!("--ttl-hours must be positive, got {}", args.ttl_hours);
    }
    let token = CredentialIssuer::new(config.token_secret()?).issue(
        &args.device_id,
        args.user_name.as_deref(),
        args.title.as_deref(),
        chrono::Duration::hours(args.ttl_hours),
    )?;
    println!("{token}");
    Ok(())
}

async fn handle_device(config: &Config, cmd: DeviceCommand) -> anyhow::Result<()> {
    let queue = Arc::new(
        OfflineQueue::open(config.queue_path())
            .with_context(|| format!("failed to open queue at {}", config.queue_path().display()))?,
    );
    let credentials = Arc::new(CredentialStore::new(config.device.credential.clone()));
    let transport = Arc::new(HttpTransport::new(
        &config.device.server_url,
        config.request_timeout(),
    )?);
    let settings = RuntimeSettings::from_config(config);

    match cmd {
        DeviceCommand::Run { fixes } => {
            let identity = config.identity()?;
            if !credentials.is_present() {
                warn!("No device credential configured; every record will be queued");
            }

            let runtime = DeviceRuntime::start(
                identity,
                &settings,
                credentials,
                transport,
                Arc::clone(&queue),
                ConnectivityMonitor::new(true),
                &NoopPolicy,
            );
            let Some(sender) = runtime.fix_sender() else {
                bail!("device runtime is not accepting fixes");
            };

            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &fixes {
                Some(path) => Box::new(BufReader::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };
            let mut lines = reader.lines();
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Some(line) = line.context("failed to read fixes")? else { break };
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<PositionFix>(&line) {
                            Ok(fix) => {
                                if sender.send(fix).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping unreadable fix"),
                        }
                    }
                    () = &mut shutdown => break,
                }
            }

            drop(sender);
            runtime.shutdown().await;
            println!("Pending in offline queue: {}", queue.pending_count()?);
        }
        DeviceCommand::Drain => {
            let agent = DeliveryAgent::new(credentials, transport, queue, settings.drain_policy);
            let report = agent.drain(DrainTrigger::Manual).await;
            println!("Drain ({})", report.trigger);
            println!("  Outcome:    {:?}", report.outcome);
            println!("  Attempted:  {}", report.attempted);
            println!("  Delivered:  {}", report.delivered);
            println!("  Failed:     {}", report.failed);
        }
    }
    Ok(())
}

fn handle_queue(config: &Config, cmd: QueueCommand) -> anyhow::Result<()> {
    let queue = OfflineQueue::open(config.queue_path())?;

    match cmd {
        QueueCommand::Status { json } => {
            let stats = queue.stats()?;
            if json {
                let status = serde_json::json!({
                    "path": queue.path(),
                    "pending": stats.pending,
                    "oldest_recorded_at": stats.oldest_recorded_at,
                    "newest_recorded_at": stats.newest_recorded_at,
                    "db_size_bytes": stats.db_size_bytes,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Offline queue");
                println!("-------------");
                println!("Path:     {}", queue.path().display());
                println!("Pending:  {}", stats.pending);
                if let Some(oldest) = stats.oldest_recorded_at {
                    println!("Oldest:   {}", oldest.to_rfc3339());
                }
                if let Some(newest) = stats.newest_recorded_at {
                    println!("Newest:   {}", newest.to_rfc3339());
                }
                println!("Size:     {} bytes", stats.db_size_bytes);
            }
        }
        QueueCommand::List { limit } => {
            let entries = queue.list_pending()?;
            if entries.is_empty() {
                println!("Queue is empty.");
            }
            for entry in entries.iter().take(limit) {
                println!(
                    "{:>6}  {}  {:>10.6} {:>11.6}  {}",
                    entry.local_id,
                    entry.recorded_at.to_rfc3339(),
                    entry.latitude,
                    entry.longitude,
                    entry.record_id
                );
            }
            if entries.len() > limit {
                println!("... {} more", entries.len() - limit);
            }
        }
        QueueCommand::Clear { yes } => {
            if yes {
                let removed = queue.clear()?;
                println!("Removed {removed} pending records.");
            } else {
                println!(
                    "This will delete {} undelivered records.",
                    queue.pending_count()?
                );
                println!("Use --yes to confirm.");
            }
        }
    }
    Ok(())
}

async fn handle_viewer(config: &Config, cmd: ViewerCommand) -> anyhow::Result<()> {
    let ViewerCommand::Watch { url, fresh } = cmd;
    let session = match url {
        Some(url) => ViewerSession::new(
            url,
            TrackerSettings::from_config(config),
            config.tick_interval(),
        )
        .with_snapshot(config.viewer_snapshot_path()),
        None => ViewerSession::from_config(config),
    }
    .with_restore(!fresh);
    info!(url = %session.url(), "Watching realtime channel");

    let (tx, mut rx) = mpsc::channel(64);
    let task = session.spawn(tx);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            () = &mut shutdown => break,
        }
    }

    drop(rx);
    task.finish().await?;
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                let mut shown = config.clone();
                shown.device.credential = CredentialStore::new(shown.device.credential).masked();
                if shown.server.token_secret.is_some() {
                    shown.server.token_secret = Some("***".to_string());
                }
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else {
                let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Device]");
                println!("  Device id:          {}", or_unset(&config.device.device_id));
                println!("  User name:          {}", or_unset(&config.device.user_name));
                println!("  Title:              {}", or_unset(&config.device.title));
                println!("  Server URL:         {}", config.device.server_url);
                println!(
                    "  Credential:         {}",
                    CredentialStore::new(config.device.credential.clone())
                        .masked()
                        .unwrap_or_else(|| "(unset)".to_string())
                );
                println!("  Queue path:         {}", config.queue_path().display());
                println!("  Min distance (m):   {}", config.device.min_distance_m);
                println!();
                println!("[Delivery]");
                println!("  Max attempts:       {}", config.delivery.max_attempts);
                println!("  Drain interval (s): {}", config.delivery.drain_interval_secs);
                println!();
                println!("[Server]");
                println!("  Bind:               {}", config.server.bind);
                println!("  Database path:      {}", config.database_path().display());
                println!(
                    "  Token secret:       {}",
                    if config.token_secret().is_ok() { "set" } else { "(unset)" }
                );
                println!();
                println!("[Viewer]");
                println!("  Hub URL:            {}", config.viewer.hub_url);
                println!("  Tick (s):           {}", config.viewer.tick_interval_secs);
                println!(
                    "  Snapshot:           {}",
                    config
                        .viewer_snapshot_path()
                        .map_or_else(|| "(off)".to_string(), |p| p.display().to_string())
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => handle_validate(file)?,
    }
    Ok(())
}

fn handle_validate(file: Option<PathBuf>) -> anyhow::Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    Config::load_from(Some(path)).context("configuration is invalid")?;
    println!("Configuration is valid.");
    Ok(())
}
