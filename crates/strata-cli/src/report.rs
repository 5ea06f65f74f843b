//! Terminal output for each subcommand. `--json` prints the underlying value
//! instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_core::{
  aggregate::{CustomerMonth, ProductDay},
  dimension::{Attributes, DimensionVersion, ValidTo},
  event::Orphan,
  run::RunSummary,
};
use strata_quality::{Evaluation, ScorecardEntry};

pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn ts(at: DateTime<Utc>) -> String { at.format("%Y-%m-%d %H:%M:%S%.f").to_string() }

fn valid_to(to: ValidTo) -> String {
  match to {
    ValidTo::At(at) => ts(at),
    ValidTo::Open => "open".into(),
  }
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
  value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

fn attributes(attrs: &Attributes) -> String {
  attrs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ")
}

// ─── Runs ────────────────────────────────────────────────────────────────────

pub fn run_summary(summary: &RunSummary) {
  let w = &summary.writer;
  let b = &summary.binder;
  let r = &summary.responses;
  println!("run {}  {}", summary.run_id, summary.status);
  println!("  run at      {}  (changes closed at {})", ts(summary.run_at), ts(summary.closing_at));
  println!(
    "  versions    {} created, {} versioned, {} updated in place, {} unchanged",
    w.created, w.versioned, w.updated_in_place, w.unchanged
  );
  println!(
    "  facts       {} bound, {} duplicates, {} rejected ({} orphans)",
    b.bound, b.duplicates, b.rejected, summary.orphans
  );
  println!("  responses   {} bound, {} duplicates, {} rejected", r.bound, r.duplicates, r.rejected);
  println!(
    "  malformed   {} snapshots, {} events, {} responses, {} feed rows",
    w.malformed, b.malformed, r.malformed, summary.rejected_rows
  );
  match &summary.rollup {
    Some(r) => println!("  rollup      {} entities, {} updated", r.entities, r.updated),
    None => println!("  rollup      skipped"),
  }
  match &summary.aggregates {
    Some(a) => println!(
      "  aggregates  {} customer months, {} product days",
      a.customer_months, a.product_days
    ),
    None => println!("  aggregates  skipped"),
  }
  let violations = summary.invariant_violations();
  if violations > 0 {
    println!("  invariant violations: {violations}");
  }
  if let Some(failure) = &summary.failure {
    println!("  failure: {failure}");
  }
}

pub fn runs(runs: &[RunSummary]) {
  if runs.is_empty() {
    println!("no runs recorded");
    return;
  }
  for r in runs {
    println!(
      "{}  {:<10}  {}  {} versions, {} facts, {} orphans",
      r.run_id,
      r.status.to_string(),
      ts(r.started_at),
      r.writer.created + r.writer.versioned,
      r.binder.bound,
      r.orphans
    );
  }
}

pub fn orphans(orphans: &[Orphan]) {
  if orphans.is_empty() {
    println!("no orphans");
    return;
  }
  for o in orphans {
    println!(
      "{}  {}/{}  at {}  {}",
      o.event_id,
      o.dimension,
      o.business_key,
      ts(o.occurred_at),
      o.reason
    );
  }
}

// ─── Versions ────────────────────────────────────────────────────────────────

pub fn version(v: &DimensionVersion) {
  println!(
    "{}  [{}, {})  {}",
    v.surrogate_key,
    ts(v.valid_from),
    valid_to(v.valid_to),
    if v.is_current { "current" } else { "closed" }
  );
  println!("    tracked    {}", attributes(&v.tracked));
  if !v.untracked.is_empty() {
    println!("    untracked  {}", attributes(&v.untracked));
  }
  println!(
    "    metrics    {} events, {} total",
    v.metrics.event_count, v.metrics.total_amount
  );
}

pub fn history(versions: &[DimensionVersion]) {
  for v in versions {
    version(v);
  }
}

// ─── Quality ─────────────────────────────────────────────────────────────────

pub fn quality(evaluation: &Evaluation) {
  let report = &evaluation.report;
  println!("evaluation {}  at {}", evaluation.evaluation_id, ts(evaluation.evaluated_at));
  for r in &report.results {
    println!(
      "{:<8} {:<9} {:<13} {:>6}/{:<6} {:>6.2}%  {}",
      r.status.to_string(),
      r.severity.to_string(),
      r.category.to_string(),
      r.failed_records,
      r.total_records,
      r.failure_percentage,
      r.rule
    );
    for e in &r.exceptions {
      println!("           {}: {}", e.record, e.detail);
    }
  }

  let card = &report.scorecard;
  println!();
  println!(
    "scorecard  overall {:.2}  ({} passed, {} warning, {} failed)",
    card.overall, card.passed, card.warning, card.failed
  );
  for (category, score) in &card.categories {
    println!("  {:<13} {score:>6.2}", category.to_string());
  }
}

pub fn scorecards(entries: &[ScorecardEntry]) {
  if entries.is_empty() {
    println!("no evaluations recorded");
    return;
  }
  for e in entries {
    let card = &e.scorecard;
    println!(
      "{}  {}  overall {:>6.2}  {} passed, {} warning, {} failed",
      e.evaluation_id,
      ts(e.evaluated_at),
      card.overall,
      card.passed,
      card.warning,
      card.failed
    );
  }
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

pub fn aggregates(months: &[CustomerMonth], days: &[ProductDay]) {
  println!("customer monthly");
  for m in months {
    println!(
      "  {:<8} {}  {:>4} txns  {:>6} units  net {}  discount {}  avg {}",
      m.customer.to_string(),
      m.year_month,
      m.transactions,
      m.quantity,
      m.net_total,
      m.discount_total,
      m.average_net
    );
  }
  println!("product daily");
  for d in days {
    println!(
      "  {:<8} {}  {:>6} units  revenue {}  cost {}  profit {}  {} customers",
      d.product.to_string(),
      d.date_key,
      d.units_sold,
      d.revenue,
      or_dash(d.cost),
      or_dash(d.profit),
      d.unique_customers
    );
  }
}
