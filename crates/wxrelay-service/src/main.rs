//! wxrelay - upload relay for weather station readings.
//!
//! Run with: `cargo run -p wxrelay-service -- run`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{error, info, warn};

use wxrelay_core::{AggregationEngine, export_bulk};
use wxrelay_service::destinations::{self, Shared};
use wxrelay_service::{Config, ConfigError, Dispatcher, LiveFeed, Mode, SystemClock, Uploader};
use wxrelay_store::{ReadingStore, StatusStore, Store};

/// wxrelay - upload weather station readings to CWOP and OpenWeatherMap.
#[derive(Parser, Debug)]
#[command(name = "wxrelay")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Reading store path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch for new readings and upload them (default behavior).
    Run,

    /// Create or update a destination's remote station identity.
    Register {
        /// Destination id from the configuration.
        destination: String,
    },

    /// Make one upload pass to a destination and report the outcome.
    Upload {
        /// Destination id from the configuration.
        destination: String,

        /// Upload the latest reading instead of catching up.
        #[arg(long)]
        live: bool,
    },

    /// Export a bulk CSV report of stored readings.
    Export {
        /// Output CSV file.
        output: PathBuf,

        /// First report time (RFC 3339). Defaults to the oldest reading.
        #[arg(long, value_parser = parse_time)]
        since: Option<OffsetDateTime>,

        /// Report times before this (RFC 3339). Defaults to past the newest reading.
        #[arg(long, value_parser = parse_time)]
        until: Option<OffsetDateTime>,
    },

    /// Validate the configuration and exit.
    CheckConfig,
}

fn parse_time(s: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| format!("invalid RFC 3339 time '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
                tracing_subscriber::EnvFilter::try_new(format!(
                    "wxrelay_service={level},wxrelay_core={level},wxrelay_store={level}"
                ))
            })?,
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    match args.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Register { destination }) => register(&config, &destination).await,
        Some(Command::Upload { destination, live }) => upload(&config, &destination, live).await,
        Some(Command::Export {
            output,
            since,
            until,
        }) => export(&config, output, since, until),
        Some(Command::Run) | None => run(config).await,
    }
}

/// Open stores and build the engine shared by every destination.
fn open(config: &Config) -> anyhow::Result<(Arc<Store>, Shared)> {
    let errors = config.global_errors();
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors).into());
    }
    let tz = config
        .station
        .tz()
        .map_err(|e| ConfigError::Validation(vec![e]))?;

    info!("Opening reading store at {:?}", config.storage.path);
    let store = Arc::new(Store::open(&config.storage.path)?);
    let status: Arc<dyn StatusStore> = match &config.storage.status_path {
        Some(path) => {
            info!("Opening upload status store at {:?}", path);
            Arc::new(Store::open(path)?)
        }
        None => store.clone(),
    };

    let readings: Arc<dyn ReadingStore> = store.clone();
    let shared = Shared {
        engine: Arc::new(AggregationEngine::new(readings, tz)),
        status,
        clock: Arc::new(SystemClock),
    };
    Ok((store, shared))
}

/// Build the named destination, failing if it is unknown or invalid.
fn destination(config: &Config, shared: &Shared, id: &str) -> anyhow::Result<Arc<dyn Uploader>> {
    let (index, dest) = config
        .destinations
        .iter()
        .enumerate()
        .find(|(_, d)| d.id == id)
        .with_context(|| format!("no destination '{}' in configuration", id))?;
    let errors = dest.validate(&format!("destinations[{}]", index), &config.station);
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors).into());
    }
    Ok(destinations::build(dest, &config.station, shared)?)
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!(
        "Configuration OK: {} destination(s), timezone {}",
        config.destinations.len(),
        config.station.timezone
    );
    Ok(())
}

async fn register(config: &Config, id: &str) -> anyhow::Result<()> {
    let (_store, shared) = open(config)?;
    let uploader = destination(config, &shared, id)?;
    let identity = uploader.register().await?;
    println!("{}: registered as {}", id, identity);
    Ok(())
}

async fn upload(config: &Config, id: &str, live: bool) -> anyhow::Result<()> {
    let (store, shared) = open(config)?;
    let uploader = destination(config, &shared, id)?;

    let attempts = if live {
        let reading = store.latest()?.context("reading store is empty")?;
        vec![uploader.upload_now(&reading, Mode::Live).await]
    } else {
        uploader.catch_up().await
    };

    if attempts.is_empty() {
        println!("{}: nothing to upload", id);
    }
    for attempt in &attempts {
        println!(
            "{} {} {}: {} ({})",
            attempt.destination, attempt.mode, attempt.reading_at, attempt.outcome, attempt.message
        );
    }
    if attempts.iter().any(|a| !a.outcome.is_success()) {
        bail!("upload to '{}' failed", id);
    }
    Ok(())
}

fn export(
    config: &Config,
    output: PathBuf,
    since: Option<OffsetDateTime>,
    until: Option<OffsetDateTime>,
) -> anyhow::Result<()> {
    let (store, shared) = open(config)?;
    let start = match since {
        Some(t) => t,
        None => match store.first()? {
            Some(first) => first.timestamp,
            None => bail!("reading store is empty"),
        },
    };
    let stop = match until {
        Some(t) => t,
        None => match store.latest()? {
            Some(latest) => latest.timestamp + time::Duration::SECOND,
            None => bail!("reading store is empty"),
        },
    };

    let file = std::fs::File::create(&output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let rows = export_bulk(&shared.engine, start, stop, std::io::BufWriter::new(file))?;
    info!("Exported {} report(s) to {}", rows, output.display());
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let (store, shared) = open(&config)?;

    let (usable, errors) = config.usable_destinations();
    for e in &errors {
        error!("Destination disabled: {}", e);
    }
    let mut uploaders = Vec::with_capacity(usable.len());
    for dest in usable {
        match destinations::build(dest, &config.station, &shared) {
            Ok(uploader) => {
                info!(destination = %dest.id, kind = %dest.kind, modes = ?dest.modes(), "Destination ready");
                uploaders.push(uploader);
            }
            Err(e) => error!(destination = %dest.id, "Destination disabled: {}", e),
        }
    }
    if uploaders.is_empty() {
        bail!("no usable destinations configured");
    }

    let feed = Arc::new(LiveFeed::new(
        store,
        std::time::Duration::from_secs(config.live.poll_interval),
    ));
    let dispatcher = Arc::new(Dispatcher::new(uploaders));
    let (stop_tx, stop_rx) = watch::channel(false);

    let readings = feed.subscribe();
    let dispatcher_task = tokio::spawn(Arc::clone(&dispatcher).run(readings, stop_rx.clone()));
    let feed_task = {
        let feed = Arc::clone(&feed);
        tokio::spawn(async move { feed.run(stop_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if stop_tx.send(true).is_err() {
        warn!("Workers already stopped");
    }
    feed_task.await?;
    dispatcher_task.await?;
    Ok(())
}
