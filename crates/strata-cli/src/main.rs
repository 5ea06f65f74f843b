//! `strata`: load snapshot and event feeds into the temporal dimension store
//! and inspect the result.
//!
//! # Usage
//!
//! ```text
//! strata run
//! strata --config prod.toml run --effective-date 2024-06-01
//! strata resolve customer C-1042 2024-03-15T10:30:00Z
//! strata history customer C-1042
//! strata quality --rules quality.toml
//! strata scorecards --limit 5
//! strata aggregates
//! strata runs --limit 5
//! ```

mod commands;
mod config;
mod report;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use strata_feed::TimestampFormat;
use strata_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::StrataConfig;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Temporal dimension warehouse loader")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, global = true, default_value = "strata.toml", env = "STRATA_CONFIG")]
  config: PathBuf,

  /// Log line format on stderr.
  #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
  log_format: LogFormat,

  /// Print results as JSON on stdout.
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
  Text,
  Json,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load the configured feeds and run the pipeline once.
  Run {
    /// Close changed versions at this instant instead of the run time.
    #[arg(long, value_parser = parse_timestamp)]
    effective_date: Option<DateTime<Utc>>,
  },
  /// Show the version of an entity that was valid at an instant.
  Resolve {
    dimension:    String,
    business_key: String,
    #[arg(value_parser = parse_timestamp)]
    at:           DateTime<Utc>,
  },
  /// Show every version of an entity.
  History { dimension: String, business_key: String },
  /// Evaluate the data-quality rule catalog, record it and print the
  /// scorecard.
  Quality {
    /// Rule catalog; defaults to `quality_rules` from the config file.
    #[arg(long)]
    rules: Option<PathBuf>,
  },
  /// List recorded scorecards, newest first.
  Scorecards {
    #[arg(long, default_value_t = 10)]
    limit: usize,
  },
  /// Show the customer-monthly and product-daily aggregates.
  Aggregates,
  /// List recent runs, newest first.
  Runs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
  },
  /// List the orphaned event references logged by one run.
  Orphans { run_id: Uuid },
  /// Break a run lock left behind by a crashed run.
  Unlock,
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`, all UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
  TimestampFormat::Auto.parse(raw).ok_or_else(|| format!("invalid timestamp {raw:?}"))
}

fn init_tracing(format: LogFormat) {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .from_env_lossy();
  let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
  match format {
    LogFormat::Text => builder.init(),
    LogFormat::Json => builder.json().init(),
  }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  let cli = Cli::parse();
  init_tracing(cli.log_format);

  let config = StrataConfig::load(&cli.config)?;
  let store = SqliteStore::open(&config.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", config.store_path))?;

  let json = cli.json;
  match cli.command {
    Command::Run { effective_date } => {
      commands::run(&config, &store, effective_date, json).await
    }
    Command::Resolve { dimension, business_key, at } => {
      commands::resolve(&config, &store, &dimension, &business_key, at, json).await
    }
    Command::History { dimension, business_key } => {
      commands::history(&store, &dimension, &business_key, json).await
    }
    Command::Quality { rules } => {
      commands::quality(&config, &store, rules.as_deref(), json).await
    }
    Command::Scorecards { limit } => commands::scorecards(&store, limit, json).await,
    Command::Aggregates => commands::aggregates(&store, json).await,
    Command::Runs { limit } => commands::runs(&store, limit, json).await,
    Command::Orphans { run_id } => commands::orphans(&store, run_id, json).await,
    Command::Unlock => commands::unlock(&store).await,
  }
}
