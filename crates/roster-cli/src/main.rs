use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use roster_core::{CheckInOutcome, MatchResult};
use roster_hw::Camera;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

mod camera;
mod config;
mod engine;
mod speech;
mod store;

use config::Config;
use engine::{spawn_engine, EngineHandle, ImageInput};
use store::SqliteAttendanceStore;

#[derive(Parser)]
#[command(name = "roster", about = "Face recognition attendance kiosk")]
struct Cli {
    /// TOML configuration file (ROSTER_* variables still override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face under a name
    Register {
        name: String,
        /// Use this photo instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Identify every face in a photo or camera frame
    Recognize {
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Recognize and record attendance once
    CheckIn {
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Check in from the camera periodically until Ctrl-C
    Kiosk,
    /// List registered identities
    List,
    /// Remove every image registered under a name
    Remove { name: String },
    /// Discard the gallery cache and re-extract all faces
    Rebuild,
    /// Show attendance records for a day (default: today)
    History {
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Show the active strategy and gallery state
    Status,
    /// Run camera diagnostics
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let json = cli.json;

    match cli.command {
        Commands::Register { name, image } => {
            let engine = start(&config).await?;
            let entry = engine.register(name, input(image.as_deref())?).await?;
            if json {
                print_json(&serde_json::json!({
                    "identity": entry.identity,
                    "sources": entry.sources,
                }))?;
            } else {
                println!("Registered {} ({} image(s))", entry.identity, entry.sources.len());
            }
        }
        Commands::Recognize { image } => {
            let engine = start(&config).await?;
            let results = engine.recognize(input(image.as_deref())?).await?;
            if json {
                print_json(&results)?;
            } else if results.is_empty() {
                println!("No faces recognized");
            } else {
                for result in &results {
                    print_match(result);
                }
            }
        }
        Commands::CheckIn { image } => {
            let engine = start(&config).await?;
            let outcomes = engine.check_in(input(image.as_deref())?).await?;
            print_outcomes(&outcomes, json)?;
        }
        Commands::Kiosk => {
            let engine = start(&config).await?;
            let mut ticker = tokio::time::interval(Duration::from_millis(config.kiosk_interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = config.kiosk_interval_ms, "kiosk running, Ctrl-C to stop");

            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::info!("kiosk shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match engine.check_in(ImageInput::Camera).await {
                            Ok(outcomes) => print_outcomes(&outcomes, json)?,
                            Err(e) => tracing::warn!(error = %e, "check-in round failed"),
                        }
                    }
                }
            }
        }
        Commands::List => {
            let engine = start(&config).await?;
            let identities = engine.list().await?;
            if json {
                print_json(&identities)?;
            } else if identities.is_empty() {
                println!("No faces registered");
            } else {
                for identity in &identities {
                    println!("{identity}");
                }
            }
        }
        Commands::Remove { name } => {
            let engine = start(&config).await?;
            let removed = engine.remove(name.clone()).await?;
            if json {
                print_json(&serde_json::json!({ "identity": name, "removed": removed }))?;
            } else if removed == 0 {
                println!("No images registered under {name}");
            } else {
                println!("Removed {removed} image(s) for {name}");
            }
        }
        Commands::Rebuild => {
            let engine = start(&config).await?;
            let count = engine.rebuild().await?;
            if json {
                print_json(&serde_json::json!({ "identities": count }))?;
            } else {
                println!("Gallery rebuilt: {count} identities");
            }
        }
        Commands::Status => {
            let engine = start(&config).await?;
            let status = engine.status().await?;
            if json {
                print_json(&status)?;
            } else {
                println!("strategy:      {} ({})", status.strategy, status.signature);
                println!("detector:      {}", status.detector);
                println!("min face size: {}px", status.min_face_size);
                println!("gallery:       {}", status.gallery_dir.display());
                println!("cache:         {}", status.cache_path.display());
                println!("identities:    {}", status.identities);
                println!("database:      {}", config.db_path.display());
            }
        }
        Commands::History { date } => history(&config, date, json)?,
        Commands::Test => camera_test(&config)?,
    }

    Ok(())
}

async fn start(config: &Config) -> Result<EngineHandle> {
    spawn_engine(config).await.context("failed to start roster engine")
}

fn input(path: Option<&Path>) -> Result<ImageInput> {
    match path {
        Some(path) => {
            let image = image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
            Ok(ImageInput::Still(image))
        }
        None => Ok(ImageInput::Camera),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_match(result: &MatchResult) {
    let region = &result.region;
    println!(
        "{:<20} confidence {:>5.1}%  at ({:.0}, {:.0}) {:.0}x{:.0}",
        result.label(),
        result.confidence * 100.0,
        region.x,
        region.y,
        region.width,
        region.height
    );
}

fn print_outcomes(outcomes: &[CheckInOutcome], json: bool) -> Result<()> {
    if json {
        if !outcomes.is_empty() {
            print_json(outcomes)?;
        }
        return Ok(());
    }
    for outcome in outcomes {
        match outcome {
            CheckInOutcome::Recorded {
                identity,
                is_late,
                confidence,
                ..
            } => println!(
                "{identity}: marked present ({}, {:.1}% confidence)",
                if *is_late { "late" } else { "on time" },
                confidence * 100.0
            ),
            CheckInOutcome::AlreadyMarked { identity } => println!("{identity}: already marked today"),
            CheckInOutcome::Unrecognized { confidence } => {
                println!("unknown face ({:.1}% best confidence)", confidence * 100.0)
            }
        }
    }
    Ok(())
}

fn history(config: &Config, date: Option<NaiveDate>, json: bool) -> Result<()> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let store = SqliteAttendanceStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let rows = store.records_on(date)?;

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No attendance recorded on {date}");
        return Ok(());
    }
    println!("Attendance on {date}:");
    for row in &rows {
        println!(
            "  {}  {:<20} {:<8} {:<8} {:.1}%",
            row.time,
            row.name,
            row.status,
            row.late,
            row.confidence * 100.0
        );
    }
    Ok(())
}

/// Direct camera test, bypassing the engine.
fn camera_test(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for dev in &devices {
        println!("  {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let settings = config.camera_settings();
    let camera = Camera::open(&settings.device, settings.width, settings.height)
        .with_context(|| format!("failed to open {}", settings.device))?;
    let frame = camera
        .capture_after_warmup(settings.warmup_frames, settings.timeout)
        .context("capture failed")?;

    println!("device:     {}", camera.device_path);
    println!("format:     {:?}", camera.fourcc);
    println!("resolution: {}x{}", frame.width, frame.height);
    println!("brightness: {:.1}", frame.avg_brightness());
    println!("dark frame: {}", if frame.is_dark { "yes" } else { "no" });
    Ok(())
}
