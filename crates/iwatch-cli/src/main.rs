use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use iwatch_client::{CatalogClient, CatalogSource, ClientConfig, SCOPE_UNIVERSE};
use iwatch_sync::{ScanRunner, ScheduleConfig, Scheduler};
use iwatch_tracker::{ChangeTracker, ScanType};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default scan set when neither --scopes nor --all is given.
const DEFAULT_SCOPES: [&str; 9] = ["NY", "NJ", "CT", "MA", "PA", "RI", "VT", "NH", "ME"];

#[derive(Debug, Parser)]
#[command(name = "iwatch")]
#[command(about = "Incentive catalog monitor", version)]
struct Cli {
    /// Tracker database path.
    #[arg(long, global = true, default_value = "iwatch.db")]
    db: PathBuf,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan scopes for new and changed programs.
    Scan {
        /// Comma-separated scope codes.
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,

        /// Scan every scope, territories included.
        #[arg(long)]
        all: bool,

        /// Fetch full program details for every listing.
        #[arg(long)]
        details: bool,

        /// Write the scan report to a JSON file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the daily scan scheduler in the foreground.
    Daemon {
        /// Daily scan time, HH:MM (UTC).
        #[arg(long, default_value = "03:00")]
        time: String,

        /// Fetch full program details during scheduled scans.
        #[arg(long)]
        details: bool,
    },
    /// List programs first seen within a window.
    CheckNew {
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// RFC 3339 timestamp; overrides --days.
        #[arg(long)]
        since: Option<String>,
    },
    /// Tracker statistics.
    Stats,
    /// Export tracked programs to a file.
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        #[arg(long)]
        output: Option<PathBuf>,

        /// Include programs no longer seen upstream.
        #[arg(long)]
        include_inactive: bool,
    },
    /// Change history for one program, or recent scan runs when no id is
    /// given.
    History {
        #[arg(long)]
        external_id: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check upstream API and site availability.
    ApiStatus,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Scan {
            scopes,
            all,
            details,
            output,
        } => run_scan(&cli.db, scopes, all, details, output).await,
        Commands::Daemon { time, details } => run_daemon(&cli.db, &time, details).await,
        Commands::CheckNew { days, since } => check_new(&cli.db, days, since).await,
        Commands::Stats => stats(&cli.db).await,
        Commands::Export {
            format,
            output,
            include_inactive,
        } => export(&cli.db, format, output, include_inactive).await,
        Commands::History { external_id, limit } => {
            history(&cli.db, external_id.as_deref(), limit).await
        }
        Commands::ApiStatus => api_status().await,
    }
}

async fn build_runner(db: &PathBuf) -> Result<ScanRunner> {
    let client = CatalogClient::new(ClientConfig::default())?;
    let tracker = ChangeTracker::open(db)
        .await
        .with_context(|| format!("opening tracker database {}", db.display()))?;
    Ok(ScanRunner::new(
        Arc::new(client) as Arc<dyn CatalogSource>,
        tracker,
    ))
}

async fn run_scan(
    db: &PathBuf,
    scopes: Vec<String>,
    all: bool,
    details: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let runner = build_runner(db).await?;

    let (scan_type, scopes) = if all {
        (
            ScanType::Full,
            SCOPE_UNIVERSE.iter().map(|s| s.to_string()).collect(),
        )
    } else if scopes.is_empty() {
        (
            ScanType::Manual,
            DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        )
    } else {
        (ScanType::Manual, scopes)
    };

    let mut progress = |scope: &str, index: usize, total: usize| {
        println!("scanning {scope} ({index}/{total})");
    };
    let report = runner
        .run(scan_type, &scopes, details, Some(&mut progress))
        .await?;

    println!(
        "scan complete: {} found, {} new, {} updated, {} removed",
        report.total_found,
        report.new_count(),
        report.updated_count(),
        report.removed_count
    );
    for sighting in report.new_programs.iter().take(10) {
        println!(
            "  new: {} {} [{}]",
            sighting.external_id,
            sighting.name.as_deref().unwrap_or("(unnamed)"),
            sighting.scope.as_deref().unwrap_or("?")
        );
    }
    if report.new_programs.len() > 10 {
        println!("  ... and {} more", report.new_programs.len() - 10);
    }
    for error in &report.errors {
        eprintln!("  error: {error}");
    }

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("report written to {}", path.display());
    }
    Ok(())
}

async fn run_daemon(db: &PathBuf, time: &str, details: bool) -> Result<()> {
    let scan_time = NaiveTime::parse_from_str(time, "%H:%M")
        .with_context(|| format!("invalid --time {time:?}, expected HH:MM"))?;

    let mut config = ScheduleConfig::from_env();
    config.scan_time = scan_time;
    config.include_details = details || config.include_details;

    let runner = Arc::new(build_runner(db).await?);
    let scheduler = Scheduler::new(runner, config)?;
    scheduler.add_callback(|report| {
        println!(
            "scheduled scan {}: {} new, {} updated",
            report.scan_id,
            report.new_count(),
            report.updated_count()
        );
    });

    scheduler.start().await?;
    println!("daemon running, daily scan at {time} UTC; ctrl-c to stop");

    let on_signal = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(err) = on_signal.stop().await {
                tracing::error!(%err, "scheduler shutdown failed");
            }
        }
    });
    scheduler.wait().await;
    Ok(())
}

async fn check_new(db: &PathBuf, days: i64, since: Option<String>) -> Result<()> {
    let tracker = ChangeTracker::open(db).await?;
    let (new_programs, updated_programs) = match since {
        Some(raw) => {
            let since: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("invalid --since {raw:?}, expected RFC 3339"))?
                .with_timezone(&Utc);
            (
                tracker.new_since(since).await?,
                tracker.updated_since(since).await?,
            )
        }
        None => (
            tracker.new_within_days(days).await?,
            tracker.updated_within_days(days).await?,
        ),
    };

    if new_programs.is_empty() && updated_programs.is_empty() {
        println!("nothing new or updated in the window");
        return Ok(());
    }
    if !new_programs.is_empty() {
        println!("{} new program(s):", new_programs.len());
        for detail in &new_programs {
            println!(
                "  {} {} [{}] first seen {}",
                detail.program.external_id,
                detail.program.name.as_deref().unwrap_or("(unnamed)"),
                detail.program.scope.as_deref().unwrap_or("?"),
                detail.program.first_seen_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    if !updated_programs.is_empty() {
        println!("{} updated program(s):", updated_programs.len());
        for updated in &updated_programs {
            println!(
                "  {} {} [{}], {} field change(s)",
                updated.program.external_id,
                updated.program.name.as_deref().unwrap_or("(unnamed)"),
                updated.program.scope.as_deref().unwrap_or("?"),
                updated.changes.len()
            );
        }
    }
    Ok(())
}

async fn stats(db: &PathBuf) -> Result<()> {
    let tracker = ChangeTracker::open(db).await?;
    let stats = tracker.stats().await?;

    println!("programs: {} total, {} active", stats.total_programs, stats.active_programs);
    println!(
        "new: {} in 24h, {} in 7d; {} field changes recorded",
        stats.new_last_24h, stats.new_last_7d, stats.total_changes
    );
    for entry in &stats.by_scope {
        println!("  {}: {}", entry.scope, entry.count);
    }
    match &stats.last_scan {
        Some(run) => println!(
            "last scan: #{} {} ({}, {} found, {} new)",
            run.id, run.scan_type, run.status, run.total_found, run.new_count
        ),
        None => println!("last scan: never"),
    }
    Ok(())
}

async fn export(
    db: &PathBuf,
    format: ExportFormat,
    output: Option<PathBuf>,
    include_inactive: bool,
) -> Result<()> {
    let tracker = ChangeTracker::open(db).await?;
    let active_only = !include_inactive;
    let (path, count) = match format {
        ExportFormat::Json => {
            let path = output.unwrap_or_else(|| PathBuf::from("programs.json"));
            let count = tracker.export_to_json(&path, active_only).await?;
            (path, count)
        }
        ExportFormat::Csv => {
            let path = output.unwrap_or_else(|| PathBuf::from("programs.csv"));
            let count = tracker.export_to_csv(&path, active_only).await?;
            (path, count)
        }
    };
    println!("exported {} program(s) to {}", count, path.display());
    Ok(())
}

async fn history(db: &PathBuf, external_id: Option<&str>, limit: usize) -> Result<()> {
    let tracker = ChangeTracker::open(db).await?;

    let Some(external_id) = external_id else {
        let runs = tracker.scan_history(limit as i64).await?;
        if runs.is_empty() {
            println!("no scans recorded");
            return Ok(());
        }
        for run in &runs {
            println!(
                "#{} {} {} started {} ({} found, {} new, {} updated, {} removed)",
                run.id,
                run.scan_type,
                run.status,
                run.started_at.format("%Y-%m-%d %H:%M"),
                run.total_found,
                run.new_count,
                run.updated_count,
                run.removed_count
            );
        }
        return Ok(());
    };

    let Some(detail) = tracker.by_external_id(external_id).await? else {
        println!("no program tracked with id {external_id}");
        return Ok(());
    };

    println!(
        "{} {} [{}], first seen {}",
        detail.program.external_id,
        detail.program.name.as_deref().unwrap_or("(unnamed)"),
        detail.program.scope.as_deref().unwrap_or("?"),
        detail.program.first_seen_at.format("%Y-%m-%d")
    );
    let changes = tracker.history(external_id).await?;
    if changes.is_empty() {
        println!("no recorded changes");
        return Ok(());
    }
    for change in changes.iter().take(limit) {
        println!(
            "  {} {}: {} -> {}",
            change.detected_at.format("%Y-%m-%d %H:%M"),
            change.field_name,
            change.old_value.as_deref().unwrap_or("(none)"),
            change.new_value.as_deref().unwrap_or("(none)")
        );
    }
    Ok(())
}

async fn api_status() -> Result<()> {
    let client = CatalogClient::new(ClientConfig::default())?;
    let status = client.check_status().await;

    println!(
        "api: {} (status {})",
        if status.api_available { "up" } else { "down" },
        status
            .api_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "site: {} (status {})",
        if status.site_available { "up" } else { "down" },
        status
            .site_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    for error in &status.errors {
        eprintln!("  {error}");
    }
    Ok(())
}
