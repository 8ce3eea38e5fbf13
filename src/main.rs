use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nalax::analytics::models::{Dimension, Period, PeriodAggregate, TopRow};
use nalax::analytics::{geoip, Aggregator};
use nalax::clock::SystemClock;
use nalax::config::{Config, DatabaseBackend, TailConfig};
use nalax::ingest::{AccessLogParser, IngestPipeline};
use nalax::storage::{self, EventStore};

#[derive(Parser)]
#[command(name = "nalax", version)]
#[command(about = "Access-log ingestion and daily traffic aggregation", long_about = None)]
struct Cli {
    /// Database URL, overriding DATABASE_URL
    #[arg(short, long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest new lines from an access log
    Tail {
        /// Log file to read
        path: PathBuf,
        /// Lines written per transaction
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Keep polling for new lines until interrupted
        #[arg(long)]
        follow: bool,
        /// Poll interval in milliseconds when following
        #[arg(long)]
        poll_ms: Option<u64>,
    },
    /// Fold raw events older than a cutoff into daily counts
    Aggregate {
        /// Cutoff such as "2 days ago" or "2024-05-01" (default: now)
        before: Option<String>,
    },
    /// Show the busiest pages and regions
    Report {
        #[arg(short, long)]
        limit: Option<i64>,
        /// day, week, month, or total for all-time counts
        #[arg(short, long, default_value = "day")]
        period: ReportPeriod,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show row counts for every table
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Download the MaxMind database to GEOIP_DB_PATH
    GeoipUpdate {
        /// Source URL, overriding GEOIP_DOWNLOAD_URL
        #[arg(long)]
        url: Option<String>,
    },
}

/// How `report` groups the daily counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportPeriod {
    Total,
    Rollup(Period),
}

impl ReportPeriod {
    fn label(self) -> &'static str {
        match self {
            ReportPeriod::Total => "total",
            ReportPeriod::Rollup(Period::Day) => "day",
            ReportPeriod::Rollup(Period::Week) => "week",
            ReportPeriod::Rollup(Period::Month) => "month",
        }
    }
}

impl FromStr for ReportPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("total") {
            return Ok(ReportPeriod::Total);
        }
        s.parse::<Period>()
            .map(ReportPeriod::Rollup)
            .map_err(|_| format!("unknown period '{s}' (expected day, week, month or total)"))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum DimensionReport {
    Totals(Vec<TopRow>),
    Periods(Vec<PeriodAggregate>),
}

#[derive(Serialize)]
struct Report {
    period: &'static str,
    pages: DimensionReport,
    regions: DimensionReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    if let Some(url) = cli.database {
        if let Some(backend) = DatabaseBackend::from_url(&url) {
            config.database.backend = backend;
        }
        config.database.url = url;
    }

    match cli.command {
        Commands::Tail {
            path,
            batch_size,
            follow,
            poll_ms,
        } => {
            let tail_config = tail_overrides(&config.tail, batch_size, poll_ms)?;

            let store = storage::connect(&config.database).await?;
            let resolver = geoip::load(&config.geoip)?;
            let pipeline =
                IngestPipeline::new(store, AccessLogParser::new(resolver), &tail_config);

            let summary = if follow {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupt received, finishing current pass...");
                        let _ = shutdown_tx.send(true);
                    }
                });
                pipeline
                    .follow(
                        &path,
                        Duration::from_millis(tail_config.poll_interval_ms),
                        shutdown_rx,
                    )
                    .await?
            } else {
                pipeline.run_once(&path).await?
            };

            if summary.restarted {
                println!("⚠ {} was truncated; re-read from the start", path.display());
            }
            println!(
                "✓ Read {} lines, stored {} events in {} batches (offset {})",
                summary.lines, summary.inserted, summary.batches, summary.offset
            );
        }
        Commands::Aggregate { before } => {
            let store = storage::connect(&config.database).await?;
            let aggregator = Aggregator::new(store, Arc::new(SystemClock));
            // Parsed before any rows are touched
            let cutoff = aggregator
                .resolve_cutoff(before.as_deref())
                .with_context(|| {
                    format!("invalid cutoff '{}'", before.as_deref().unwrap_or("now"))
                })?;
            let report = aggregator.run(Some(cutoff)).await?;
            println!(
                "✓ Aggregated {} events before {}",
                report.events_aggregated,
                report.cutoff.to_rfc3339()
            );
        }
        Commands::Report {
            limit,
            period,
            json,
        } => {
            let limit = limit.unwrap_or(config.report.limit);
            if limit <= 0 {
                bail!("--limit must be positive");
            }
            let store = storage::connect(&config.database).await?;
            let report = build_report(store, period, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_section("Top pages", "Path", &report.pages);
                println!();
                print_section("Top regions", "Region", &report.regions);
            }
        }
        Commands::Status { json } => {
            let store = storage::connect(&config.database).await?;
            let stats = store.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{:<28} {:>12}", "Raw events", stats.raw_events);
                println!("{:<28} {:>12}", "  of which unparsed", stats.unparsed_events);
                println!("{:<28} {:>12}", "Daily page rows", stats.page_rows);
                println!("{:<28} {:>12}", "Daily region rows", stats.region_rows);
                println!("{:<28} {:>12}", "Tracked log files", stats.tracked_files);
            }
        }
        Commands::GeoipUpdate { url } => {
            let url = url
                .or_else(|| config.geoip.download_url.clone())
                .context("no download URL: pass --url or set GEOIP_DOWNLOAD_URL")?;
            let dest = config
                .geoip
                .mmdb_path
                .clone()
                .context("GEOIP_DB_PATH must be set to know where to install the database")?;

            let written = geoip::download(&url, Path::new(&dest)).await?;
            println!("✓ Installed {} bytes to {}", written, dest);
        }
    }

    Ok(())
}

/// Apply `tail` flags on top of the environment settings
fn tail_overrides(
    base: &TailConfig,
    batch_size: Option<usize>,
    poll_ms: Option<u64>,
) -> Result<TailConfig> {
    let mut tail_config = base.clone();
    if let Some(batch_size) = batch_size {
        if batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        tail_config.batch_size = batch_size;
    }
    if let Some(poll_ms) = poll_ms {
        if poll_ms == 0 {
            bail!("--poll-ms must be at least 1");
        }
        tail_config.poll_interval_ms = poll_ms;
    }
    Ok(tail_config)
}

async fn build_report(
    store: Arc<dyn EventStore>,
    period: ReportPeriod,
    limit: i64,
) -> Result<Report> {
    let aggregator = Aggregator::new(store, Arc::new(SystemClock));
    let rows = usize::try_from(limit)?;

    let mut sections = Vec::with_capacity(Dimension::ALL.len());
    for dimension in Dimension::ALL {
        let section = match period {
            ReportPeriod::Total => DimensionReport::Totals(aggregator.top(dimension, limit).await?),
            ReportPeriod::Rollup(Period::Day) => {
                DimensionReport::Periods(aggregator.top_days(dimension, rows).await?)
            }
            ReportPeriod::Rollup(period) => {
                DimensionReport::Periods(aggregator.rollup_report(dimension, period, rows).await?)
            }
        };
        sections.push(section);
    }

    let regions = sections.pop().context("missing region section")?;
    let pages = sections.pop().context("missing page section")?;
    Ok(Report {
        period: period.label(),
        pages,
        regions,
    })
}

fn print_section(title: &str, key_header: &str, section: &DimensionReport) {
    println!("{title}");
    match section {
        DimensionReport::Totals(rows) => {
            println!("{:>12}  {}", "Count", key_header);
            println!("{}", "-".repeat(60));
            if rows.is_empty() {
                println!("(no aggregated data yet)");
            }
            for row in rows {
                println!("{:>12}  {}", row.count, row.key);
            }
        }
        DimensionReport::Periods(rows) => {
            println!("{:<12} {:>12}  {}", "Period", "Count", key_header);
            println!("{}", "-".repeat(60));
            if rows.is_empty() {
                println!("(no aggregated data yet)");
            }
            for row in rows {
                println!("{:<12} {:>12}  {}", row.period_start, row.count, row.key);
            }
        }
    }
}
