//! Rule evaluation and the category scorecard.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strata_core::{dimension::DimensionVersion, history::check_history};
use strum::{Display, EnumString, IntoEnumIterator};
use tracing::{info, warn};

use crate::{
  rule::{Catalog, Category, Comparison, Observed, Rule, RuleKind, Severity, Target},
  view::WarehouseView,
};

/// Failing records kept per result for reporting.
pub const MAX_EXCEPTIONS: usize = 20;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleStatus {
  Passed,
  /// Failures exist but stay within the rule's threshold.
  Warning,
  Failed,
}

/// One failing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
  /// Business key and surrogate key, event id, or business key alone,
  /// depending on what the rule inspects.
  pub record: String,
  pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
  pub rule:               String,
  pub category:           Category,
  pub severity:           Severity,
  pub total_records:      u64,
  pub failed_records:     u64,
  pub failure_percentage: f64,
  pub status:             RuleStatus,
  /// At most [`MAX_EXCEPTIONS`] examples.
  pub exceptions:         Vec<Exception>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
  /// Every category, scored 0-100 and rounded to two decimals.
  pub categories:     BTreeMap<Category, f64>,
  pub overall:        f64,
  pub total_records:  u64,
  pub failed_records: u64,
  pub passed:         usize,
  pub warning:        usize,
  pub failed:         usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
  pub results:   Vec<RuleResult>,
  pub scorecard: Scorecard,
}

impl QualityReport {
  /// Whether any critical rule failed outright.
  pub fn has_critical_failure(&self) -> bool {
    self
      .results
      .iter()
      .any(|r| r.severity == Severity::Critical && r.status == RuleStatus::Failed)
  }
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Counts records and collects failures for one rule.
#[derive(Default)]
struct Tally {
  total:      u64,
  failed:     u64,
  exceptions: Vec<Exception>,
}

impl Tally {
  fn pass(&mut self) { self.total += 1; }

  fn fail(&mut self, record: impl Into<String>, detail: impl Into<String>) {
    self.total += 1;
    self.failed += 1;
    if self.exceptions.len() < MAX_EXCEPTIONS {
      self.exceptions.push(Exception { record: record.into(), detail: detail.into() });
    }
  }

  fn check(&mut self, ok: bool, record: impl Into<String>, detail: impl FnOnce() -> String) {
    if ok { self.pass() } else { self.fail(record, detail()) }
  }
}

fn version_label(v: &DimensionVersion) -> String {
  format!("{}/{} {}", v.dimension, v.business_key, v.surrogate_key)
}

/// The observed values a value-level rule inspects, each with its record
/// label. Current versions lacking the attribute are skipped.
fn observations<'v>(
  view: &'v WarehouseView,
  target: &'v Target,
) -> Box<dyn Iterator<Item = (String, Observed<'v>)> + 'v> {
  match target {
    Target::Attribute { dimension, attribute } => Box::new(
      view
        .current(dimension)
        .filter_map(move |v| v.attribute(attribute).map(|a| (version_label(v), Observed::Text(a)))),
    ),
    Target::Measure { measure } => Box::new(
      view
        .facts
        .iter()
        .map(move |f| (f.event_id.clone(), Observed::Number(measure.of(f)))),
    ),
  }
}

fn in_range(value: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> bool {
  min.is_none_or(|m| value >= m) && max.is_none_or(|m| value <= m)
}

fn evaluate_kind(kind: &RuleKind, view: &WarehouseView) -> Tally {
  let mut tally = Tally::default();
  match kind {
    RuleKind::NotNull { dimension, attribute } => {
      for v in view.current(dimension) {
        let present = v.attribute(attribute).is_some_and(|a| !a.trim().is_empty());
        tally.check(present, version_label(v), || format!("{attribute} is missing"));
      }
    }
    RuleKind::Range { target, min, max } => {
      for (record, value) in observations(view, target) {
        match value {
          Observed::Number(n) => {
            tally.check(in_range(n, *min, *max), record, || format!("{n} out of range"))
          }
          Observed::Text(raw) => match raw.trim().parse::<Decimal>() {
            Ok(n) => tally.check(in_range(n, *min, *max), record, || format!("{n} out of range")),
            Err(_) => tally.fail(record, format!("{raw:?} is not a number")),
          },
        }
      }
    }
    RuleKind::Referential { dimension } => {
      let known = view.surrogate_keys(dimension);
      for fact in &view.facts {
        if let Some(key) = fact.keys.get(dimension) {
          tally.check(known.contains(key), fact.event_id.clone(), || {
            format!("{dimension} key {key} has no version")
          });
        }
      }
    }
    RuleKind::Predicate { target, check } => {
      for (record, value) in observations(view, target) {
        tally.check(check.holds(value), record, || describe(check, value));
      }
    }
    RuleKind::TemporalIntegrity { dimension } => {
      for (key, history) in by_business_key(view.versions(dimension)) {
        match check_history(history) {
          Ok(()) => tally.pass(),
          Err(violation) => tally.fail(format!("{dimension}/{key}"), violation.to_string()),
        }
      }
    }
  }
  tally
}

fn describe(check: &Comparison, value: Observed<'_>) -> String {
  let shown = match value {
    Observed::Text(t) => format!("{t:?}"),
    Observed::Number(n) => n.to_string(),
  };
  format!("{shown} fails {check:?}")
}

/// Split versions ordered by business key into one slice per key.
fn by_business_key(
  versions: &[DimensionVersion],
) -> impl Iterator<Item = (&str, &[DimensionVersion])> {
  versions
    .chunk_by(|a, b| a.business_key == b.business_key)
    .map(|chunk| (chunk[0].business_key.as_str(), chunk))
}

fn percentage(part: u64, whole: u64) -> f64 {
  if whole == 0 { 0.0 } else { part as f64 / whole as f64 * 100.0 }
}

fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }

/// Evaluate one rule against the view.
pub fn evaluate_rule(rule: &Rule, view: &WarehouseView) -> RuleResult {
  let tally = evaluate_kind(&rule.kind, view);
  let failure_percentage = percentage(tally.failed, tally.total);
  let status = if tally.failed == 0 {
    RuleStatus::Passed
  } else if failure_percentage <= rule.failure_threshold {
    RuleStatus::Warning
  } else {
    RuleStatus::Failed
  };

  match status {
    RuleStatus::Failed => warn!(
      rule = %rule.name,
      severity = %rule.severity,
      failed = tally.failed,
      total = tally.total,
      "quality rule failed"
    ),
    _ => info!(
      rule = %rule.name,
      %status,
      failed = tally.failed,
      total = tally.total,
      "quality rule evaluated"
    ),
  }

  RuleResult {
    rule: rule.name.clone(),
    category: rule.category,
    severity: rule.severity,
    total_records: tally.total,
    failed_records: tally.failed,
    failure_percentage: round2(failure_percentage),
    status,
    exceptions: tally.exceptions,
  }
}

/// Per category `(total - failed) / total * 100`, or 100 when the category
/// checked nothing; overall is the mean across all categories.
pub fn scorecard(results: &[RuleResult]) -> Scorecard {
  let mut sums: BTreeMap<Category, (u64, u64)> = BTreeMap::new();
  for r in results {
    let entry = sums.entry(r.category).or_default();
    entry.0 += r.total_records;
    entry.1 += r.failed_records;
  }

  let categories: BTreeMap<Category, f64> = Category::iter()
    .map(|c| {
      let (total, failed) = sums.get(&c).copied().unwrap_or_default();
      let score = if total == 0 { 100.0 } else { 100.0 - percentage(failed, total) };
      (c, round2(score))
    })
    .collect();
  let overall = categories.values().sum::<f64>() / categories.len() as f64;
  let count = |s: RuleStatus| results.iter().filter(|r| r.status == s).count();

  Scorecard {
    overall: round2(overall),
    total_records: results.iter().map(|r| r.total_records).sum(),
    failed_records: results.iter().map(|r| r.failed_records).sum(),
    passed: count(RuleStatus::Passed),
    warning: count(RuleStatus::Warning),
    failed: count(RuleStatus::Failed),
    categories,
  }
}

/// Evaluate every rule of the catalog, in order.
pub fn evaluate(catalog: &Catalog, view: &WarehouseView) -> QualityReport {
  let results: Vec<RuleResult> = catalog.rules.iter().map(|r| evaluate_rule(r, view)).collect();
  let scorecard = scorecard(&results);
  info!(
    rules = results.len(),
    overall = scorecard.overall,
    failed = scorecard.failed,
    "quality scorecard computed"
  );
  QualityReport { results, scorecard }
}
