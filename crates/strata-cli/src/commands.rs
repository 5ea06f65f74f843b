//! Subcommand implementations. Each returns the process exit code.

use std::{path::Path, process::ExitCode};

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use strata_core::{
  dimension::{BusinessKey, Dimension},
  event::EventRecord,
  resolver::{Resolution, Resolver},
  response::ResponseRecord,
  run::{CancelFlag, Pipeline, RunContext, RunInput, RunStatus, RunSummary},
  snapshot::Snapshot,
  store::{AggregateStore, DimensionStore},
};
use strata_feed::{Rows, load_events, load_responses, load_snapshots};
use strata_quality::{Catalog, QualityStore, evaluate_and_record};
use strata_store_sqlite::SqliteStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::StrataConfig, report};

// ─── run ─────────────────────────────────────────────────────────────────────

/// Records read from every configured feed.
#[derive(Debug, Default)]
pub struct Feeds {
  pub snapshots:     Vec<Snapshot>,
  pub events:        Vec<EventRecord>,
  pub responses:     Vec<ResponseRecord>,
  /// Rows dropped by the CSV reader before reaching the pipeline.
  pub rejected_rows: u64,
}

/// Keep the parsed rows, counting the rest as rejected.
fn keep_parsed<T>(rows: Rows<T>, into: &mut Vec<T>, rejected: &mut u64) {
  for row in rows {
    match row {
      Ok(record) => into.push(record),
      Err(_) => *rejected += 1,
    }
  }
}

/// Read every snapshot feed (in dimension order), the event feed and the
/// response feed.
pub fn load_feeds(config: &StrataConfig) -> anyhow::Result<Feeds> {
  let mut feeds = Feeds::default();
  for (dimension, profile) in &config.feeds {
    let rows = load_snapshots(dimension, profile)
      .with_context(|| format!("failed to read the {dimension} feed"))?;
    keep_parsed(rows, &mut feeds.snapshots, &mut feeds.rejected_rows);
  }
  if let Some(profile) = &config.events {
    let rows = load_events(profile).context("failed to read the event feed")?;
    keep_parsed(rows, &mut feeds.events, &mut feeds.rejected_rows);
  }
  if let Some(profile) = &config.responses {
    let rows = load_responses(profile).context("failed to read the response feed")?;
    keep_parsed(rows, &mut feeds.responses, &mut feeds.rejected_rows);
  }
  Ok(feeds)
}

/// Run the pipeline under the store's run lock and record the outcome.
///
/// The lock is released whether or not the run succeeds. Ctrl-C cancels the
/// run between records.
pub async fn execute_run(
  config: &StrataConfig,
  store: &SqliteStore,
  feeds: &Feeds,
  effective_date: Option<DateTime<Utc>>,
) -> anyhow::Result<RunSummary> {
  let mut pipeline_config = config.pipeline.clone();
  if effective_date.is_some() {
    pipeline_config.effective_date = effective_date;
  }

  let ctx = RunContext::now();
  store.acquire_run_lock(ctx.run_id).await.context("failed to acquire the run lock")?;

  let cancel = CancelFlag::new();
  let watcher = tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, stopping after the current record");
        cancel.cancel();
      }
    }
  });

  let input = RunInput {
    snapshots:     &feeds.snapshots,
    events:        &feeds.events,
    responses:     &feeds.responses,
    rejected_rows: feeds.rejected_rows,
  };
  let summary = Pipeline::new(store, pipeline_config, config.retry.clone())
    .run_with(ctx, input, &cancel)
    .await;
  watcher.abort();

  let recorded = store.record_run(&summary).await.context("failed to record the run");
  store.release_run_lock(ctx.run_id).await.context("failed to release the run lock")?;
  recorded?;
  Ok(summary)
}

pub async fn run(
  config: &StrataConfig,
  store: &SqliteStore,
  effective_date: Option<DateTime<Utc>>,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let feeds = load_feeds(config)?;
  info!(
    snapshots = feeds.snapshots.len(),
    events = feeds.events.len(),
    responses = feeds.responses.len(),
    rejected = feeds.rejected_rows,
    "feeds loaded"
  );

  let summary = execute_run(config, store, &feeds, effective_date).await?;
  if json {
    report::json(&summary)?;
  } else {
    report::run_summary(&summary);
  }
  Ok(match summary.status {
    RunStatus::Success => ExitCode::SUCCESS,
    RunStatus::Incomplete | RunStatus::Failed => ExitCode::FAILURE,
  })
}

// ─── resolve / history ───────────────────────────────────────────────────────

pub async fn resolve(
  config: &StrataConfig,
  store: &SqliteStore,
  dimension: &str,
  key: &str,
  at: DateTime<Utc>,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let dimension = Dimension::new(dimension);
  let key = BusinessKey::new(key)?;
  let resolution = Resolver::new(store, config.retry.clone())
    .resolve(&dimension, &key, at)
    .await
    .with_context(|| format!("failed to resolve {dimension}/{key}"))?;

  if json {
    report::json(&resolution)?;
  } else {
    match resolution {
      Resolution::Resolved(sk) => {
        let history = store.history(&dimension, &key).await?;
        match history.iter().find(|v| v.surrogate_key == sk) {
          Some(version) => report::version(version),
          None => println!("{sk}"),
        }
      }
      Resolution::Unresolved(reason) => println!("{dimension}/{key} unresolved at {at}: {reason}"),
    }
  }
  Ok(match resolution {
    Resolution::Resolved(_) => ExitCode::SUCCESS,
    Resolution::Unresolved(_) => ExitCode::FAILURE,
  })
}

pub async fn history(
  store: &SqliteStore,
  dimension: &str,
  key: &str,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let dimension = Dimension::new(dimension);
  let key = BusinessKey::new(key)?;
  let versions = store.history(&dimension, &key).await?;
  if versions.is_empty() {
    bail!("no versions of {dimension}/{key}");
  }
  if json {
    report::json(&versions)?;
  } else {
    report::history(&versions);
  }
  Ok(ExitCode::SUCCESS)
}

// ─── quality ─────────────────────────────────────────────────────────────────

pub async fn quality(
  config: &StrataConfig,
  store: &SqliteStore,
  rules: Option<&Path>,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let Some(path) = rules.or(config.quality_rules.as_deref()) else {
    bail!("no rule catalog: pass --rules or set quality_rules in the config file");
  };
  let catalog = Catalog::load(path)?;
  let evaluation =
    evaluate_and_record(store, &catalog).await.context("failed to evaluate the warehouse")?;

  if json {
    report::json(&evaluation)?;
  } else {
    report::quality(&evaluation);
  }
  let failed = evaluation.report.has_critical_failure();
  Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

pub async fn scorecards(
  store: &SqliteStore,
  limit: usize,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let entries = store.scorecard_history(limit).await?;
  if json {
    report::json(&entries)?;
  } else {
    report::scorecards(&entries);
  }
  Ok(ExitCode::SUCCESS)
}

// ─── aggregates ──────────────────────────────────────────────────────────────

pub async fn aggregates(store: &SqliteStore, json: bool) -> anyhow::Result<ExitCode> {
  let months = store.customer_monthly().await?;
  let days = store.product_daily().await?;
  if json {
    report::json(&serde_json::json!({ "customer_monthly": months, "product_daily": days }))?;
  } else {
    report::aggregates(&months, &days);
  }
  Ok(ExitCode::SUCCESS)
}

// ─── run log & lock ──────────────────────────────────────────────────────────

pub async fn runs(store: &SqliteStore, limit: usize, json: bool) -> anyhow::Result<ExitCode> {
  let runs = store.recent_runs(limit).await?;
  if json {
    report::json(&runs)?;
  } else {
    report::runs(&runs);
  }
  Ok(ExitCode::SUCCESS)
}

pub async fn orphans(store: &SqliteStore, run_id: Uuid, json: bool) -> anyhow::Result<ExitCode> {
  let orphans = store.run_orphans(run_id).await?;
  if json {
    report::json(&orphans)?;
  } else {
    report::orphans(&orphans);
  }
  Ok(ExitCode::SUCCESS)
}

pub async fn unlock(store: &SqliteStore) -> anyhow::Result<ExitCode> {
  match store.break_run_lock().await? {
    Some(lock) => {
      warn!(run_id = %lock.run_id, since = %lock.acquired_at, "run lock broken");
      println!("released lock held by run {} since {}", lock.run_id, lock.acquired_at);
    }
    None => println!("run lock is free"),
  }
  Ok(ExitCode::SUCCESS)
}
