//! One ETL run: write snapshots, bind events and campaign responses, roll up,
//! rebuild aggregates, summarise.
//!
//! The run never panics or returns an error to its caller; every failure is
//! folded into the [`RunSummary`] status:
//!
//! - `Failed`: a store call failed permanently (or exhausted its retries);
//! - `Incomplete`: the run was cancelled or hit an invariant violation;
//! - `Success`: otherwise.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
  Result,
  aggregate::{AggregateConfig, AggregateTally, refresh_aggregates},
  binder::{BindTally, BinderConfig, FactBinder},
  dimension::{Dimension, to_store_precision},
  event::{EventRecord, Orphan},
  response::{ResponseBinder, ResponseConfig, ResponseRecord},
  retry::{RetryConfig, retrying},
  rollup::{RollupTally, rollup},
  snapshot::Snapshot,
  store::{AggregateStore, DimensionStore, FactStore, ResponseStore},
  writer::{VersionWriter, WriterConfig, WriterTally},
};

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Shared flag checked between records. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self { Self::default() }

  pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst) }

  pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// How far a batch got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
  Completed,
  Cancelled,
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Closing timestamp for tracked changes; the run timestamp when unset.
  pub effective_date:      Option<DateTime<Utc>>,
  /// See [`BinderConfig::required_dimensions`].
  pub required_dimensions: Vec<Dimension>,
  pub responses:           ResponseConfig,
  pub aggregates:          AggregateConfig,
}

impl PipelineConfig {
  pub fn writer(&self) -> WriterConfig { WriterConfig { effective_date: self.effective_date } }

  pub fn binder(&self) -> BinderConfig {
    BinderConfig { required_dimensions: self.required_dimensions.clone() }
  }
}

// ─── Summary ─────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
  Success,
  Incomplete,
  Failed,
}

/// Identity and clock of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
  pub run_id: Uuid,
  pub run_at: DateTime<Utc>,
}

impl RunContext {
  pub fn now() -> Self { Self::at(Utc::now()) }

  /// `run_at` is cut to whole microseconds, the finest instant a store keeps.
  pub fn at(run_at: DateTime<Utc>) -> Self {
    Self { run_id: Uuid::new_v4(), run_at: to_store_precision(run_at) }
  }
}

/// Everything one run consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunInput<'a> {
  pub snapshots:     &'a [Snapshot],
  pub events:        &'a [EventRecord],
  pub responses:     &'a [ResponseRecord],
  /// Feed rows rejected while reading the inputs above.
  pub rejected_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
  pub run_id:        Uuid,
  pub started_at:    DateTime<Utc>,
  pub finished_at:   DateTime<Utc>,
  pub run_at:        DateTime<Utc>,
  /// Timestamp every tracked change in this run was closed at.
  pub closing_at:    DateTime<Utc>,
  /// Feed rows that never became records.
  #[serde(default)]
  pub rejected_rows: u64,
  pub writer:        WriterTally,
  pub binder:        BindTally,
  #[serde(default)]
  pub responses:     BindTally,
  /// Orphans logged by both binders.
  pub orphans:       u64,
  /// `None` when the run stopped before rollup.
  pub rollup:        Option<RollupTally>,
  /// `None` when the run stopped before the aggregates were rebuilt.
  #[serde(default)]
  pub aggregates:    Option<AggregateTally>,
  pub status:        RunStatus,
  /// The error that failed the run, if any.
  pub failure:       Option<String>,
}

impl RunSummary {
  pub fn invariant_violations(&self) -> u64 {
    self.writer.invariant_violations
      + self.binder.invariant_violations
      + self.responses.invariant_violations
      + self.rollup.map_or(0, |r| r.invariant_violations)
  }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline<'s, S> {
  store:  &'s S,
  config: PipelineConfig,
  retry:  RetryConfig,
}

impl<'s, S> Pipeline<'s, S>
where
  S: DimensionStore + FactStore + ResponseStore + AggregateStore,
{
  pub fn new(store: &'s S, config: PipelineConfig, retry: RetryConfig) -> Self {
    Self { store, config, retry }
  }

  /// Run with snapshots and events only.
  pub async fn run(
    &self,
    ctx: RunContext,
    snapshots: &[Snapshot],
    events: &[EventRecord],
    cancel: &CancelFlag,
  ) -> RunSummary {
    self.run_with(ctx, RunInput { snapshots, events, ..RunInput::default() }, cancel).await
  }

  pub async fn run_with(
    &self,
    ctx: RunContext,
    input: RunInput<'_>,
    cancel: &CancelFlag,
  ) -> RunSummary {
    let started_at = Utc::now();
    let closing_at = self.config.writer().closing_at(ctx.run_at);
    info!(
      run_id = %ctx.run_id,
      run_at = %ctx.run_at.to_rfc3339(),
      closing_at = %closing_at.to_rfc3339(),
      snapshots = input.snapshots.len(),
      events = input.events.len(),
      responses = input.responses.len(),
      rejected_rows = input.rejected_rows,
      "run started"
    );

    let mut stages = Stages {
      writer:     VersionWriter::new(self.store, closing_at, self.retry.clone()),
      binder:     FactBinder::new(self.store, self.config.binder(), self.retry.clone()),
      responses:  ResponseBinder::new(
        self.store,
        self.config.responses.clone(),
        self.retry.clone(),
      ),
      rollup:     None,
      aggregates: None,
    };

    let outcome = self.execute(ctx.run_id, &input, cancel, &mut stages).await;

    let mut summary = RunSummary {
      run_id: ctx.run_id,
      started_at,
      finished_at: Utc::now(),
      run_at: ctx.run_at,
      closing_at,
      rejected_rows: input.rejected_rows,
      writer: stages.writer.tally(),
      binder: stages.binder.tally(),
      responses: stages.responses.tally(),
      orphans: (stages.binder.orphans().len() + stages.responses.orphans().len()) as u64,
      rollup: stages.rollup,
      aggregates: stages.aggregates,
      status: RunStatus::Success,
      failure: None,
    };

    let status = match outcome {
      Err(e) => {
        error!(run_id = %ctx.run_id, error = %e, "run failed");
        summary.failure = Some(e.to_string());
        RunStatus::Failed
      }
      Ok(Progress::Cancelled) => {
        warn!(run_id = %ctx.run_id, "run cancelled");
        RunStatus::Incomplete
      }
      Ok(Progress::Completed) if summary.invariant_violations() > 0 => RunStatus::Incomplete,
      Ok(Progress::Completed) => RunStatus::Success,
    };
    summary.status = status;

    info!(
      run_id = %ctx.run_id,
      status = %summary.status,
      created = summary.writer.created,
      versioned = summary.writer.versioned,
      updated_in_place = summary.writer.updated_in_place,
      bound = summary.binder.bound,
      rejected = summary.binder.rejected,
      duplicates = summary.binder.duplicates,
      responses_bound = summary.responses.bound,
      rejected_rows = summary.rejected_rows,
      invariant_violations = summary.invariant_violations(),
      "run finished"
    );
    summary
  }

  async fn execute(
    &self,
    run_id: Uuid,
    input: &RunInput<'_>,
    cancel: &CancelFlag,
    stages: &mut Stages<'s, S>,
  ) -> Result<Progress> {
    let writer = &mut stages.writer;
    if writer.apply_batch(input.snapshots, cancel).await? == Progress::Cancelled {
      return Ok(Progress::Cancelled);
    }
    let tally = writer.tally();
    info!(
      run_id = %run_id,
      created = tally.created,
      versioned = tally.versioned,
      updated_in_place = tally.updated_in_place,
      unchanged = tally.unchanged,
      malformed = tally.malformed,
      "snapshots applied"
    );

    let binder = &mut stages.binder;
    let bound = binder.bind_batch(input.events, cancel).await;
    // Orphans found before a cancellation or failure are still real.
    self.record_orphans(run_id, binder.orphans()).await?;
    if bound? == Progress::Cancelled {
      return Ok(Progress::Cancelled);
    }
    let tally = binder.tally();
    info!(
      run_id = %run_id,
      bound = tally.bound,
      duplicates = tally.duplicates,
      rejected = tally.rejected,
      malformed = tally.malformed,
      "events bound"
    );

    let responses = &mut stages.responses;
    let bound = responses.bind_batch(input.responses, cancel).await;
    self.record_orphans(run_id, responses.orphans()).await?;
    if bound? == Progress::Cancelled {
      return Ok(Progress::Cancelled);
    }
    let tally = responses.tally();
    info!(
      run_id = %run_id,
      bound = tally.bound,
      duplicates = tally.duplicates,
      rejected = tally.rejected,
      malformed = tally.malformed,
      "responses bound"
    );

    stages.rollup = Some(rollup(self.store, &self.retry).await?);
    stages.aggregates =
      Some(refresh_aggregates(self.store, &self.config.aggregates, &self.retry).await?);
    Ok(Progress::Completed)
  }

  async fn record_orphans(&self, run_id: Uuid, orphans: &[Orphan]) -> Result<()> {
    if orphans.is_empty() {
      return Ok(());
    }
    let store = self.store;
    retrying(&self.retry, "record_orphans", || store.record_orphans(run_id, orphans)).await
  }
}

/// Per-stage state of one run, kept so a failed run still reports its tallies.
struct Stages<'s, S> {
  writer:     VersionWriter<'s, S>,
  binder:     FactBinder<'s, S>,
  responses:  ResponseBinder<'s, S>,
  rollup:     Option<RollupTally>,
  aggregates: Option<AggregateTally>,
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};
  use rust_decimal::Decimal;

  use super::*;
  use crate::{
    dimension::{BusinessKey, EntityMetrics, ValidTo},
    event::{DimensionRef, Measures},
    memory::MemoryStore,
    response::ResponseKind,
  };

  fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap() }

  fn customer() -> Dimension { Dimension::new("customer") }

  fn e1() -> BusinessKey { BusinessKey::new("E1").unwrap() }

  fn snapshot(address: &str) -> Snapshot {
    Snapshot::new(customer(), "E1").tracked("address", address).originated_at(t0())
  }

  fn event(id: &str, key: &str, at: DateTime<Utc>, amount: i64) -> EventRecord {
    EventRecord {
      event_id:    id.into(),
      occurred_at: at,
      refs:        vec![DimensionRef::new(customer(), key)],
      measures:    Measures {
        quantity: 1,
        unit_price: Decimal::new(amount, 2),
        gross_amount: Decimal::new(amount, 2),
        ..Default::default()
      },
    }
  }

  fn pipeline(store: &MemoryStore) -> Pipeline<'_, MemoryStore> {
    Pipeline::new(store, PipelineConfig::default(), RetryConfig::immediate(3))
  }

  #[tokio::test]
  async fn registration_then_change_then_point_in_time_binding() {
    let store = MemoryStore::new();
    let t1 = t0() + Duration::days(30);

    // Run 1 happens well after registration; valid_from must still be T0.
    let run1 = pipeline(&store)
      .run(RunContext::at(t0() + Duration::days(3)), &[snapshot("A")], &[], &CancelFlag::new())
      .await;
    assert_eq!(run1.status, RunStatus::Success);
    let v1 = store.current_version(&customer(), &e1()).await.unwrap().unwrap();
    assert_eq!(v1.valid_from, t0());
    assert_eq!(v1.valid_to, ValidTo::Open);

    let events = [
      event("S1", "E1", t0() + Duration::days(15), 1000),
      event("S2", "E1", t1 + Duration::days(15), 500),
    ];
    let run2 = pipeline(&store)
      .run(RunContext::at(t1), &[snapshot("B")], &events, &CancelFlag::new())
      .await;
    assert_eq!(run2.status, RunStatus::Success);
    assert_eq!(run2.writer.versioned, 1);

    let history = store.history(&customer(), &e1()).await.unwrap();
    assert_eq!(history[0].valid_to, ValidTo::At(t1));
    assert!(!history[0].is_current);
    assert_eq!(history[1].valid_from, t1);

    let facts = store.facts().await.unwrap();
    assert_eq!(facts[0].keys[&customer()], history[0].surrogate_key);
    assert_eq!(facts[1].keys[&customer()], history[1].surrogate_key);

    // Rollup counts facts from both versions on the current one.
    assert_eq!(
      history[1].metrics,
      EntityMetrics { event_count: 2, total_amount: Decimal::new(1500, 2) }
    );
  }

  #[tokio::test]
  async fn unknown_key_is_rejected_without_failing_the_run() {
    let store = MemoryStore::new();
    let summary = pipeline(&store)
      .run(
        RunContext::at(t0()),
        &[snapshot("A")],
        &[event("S1", "E99", t0() + Duration::days(1), 100)],
        &CancelFlag::new(),
      )
      .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.binder.rejected, 1);
    assert_eq!(summary.orphans, 1);
    let logged = store.orphans().await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].0, summary.run_id);
  }

  #[tokio::test]
  async fn two_changes_in_one_run_share_the_closing_timestamp() {
    let store = MemoryStore::new();
    pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &[], &CancelFlag::new())
      .await;

    let run_at = t0() + Duration::days(5);
    let summary = pipeline(&store)
      .run(RunContext::at(run_at), &[snapshot("B"), snapshot("C")], &[], &CancelFlag::new())
      .await;
    assert_eq!(summary.writer.versioned, 2);

    let history = store.history(&customer(), &e1()).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].valid_to, ValidTo::At(run_at));
    assert_eq!(history[1].valid_from, run_at);
    assert_eq!(history[1].valid_to, ValidTo::At(run_at));
    assert_eq!(history[2].valid_from, run_at);
    assert_eq!(history[2].tracked["address"], "C");
  }

  #[tokio::test]
  async fn effective_date_overrides_run_timestamp() {
    let store = MemoryStore::new();
    pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &[], &CancelFlag::new())
      .await;

    let effective = t0() + Duration::days(2);
    let config = PipelineConfig { effective_date: Some(effective), ..Default::default() };
    let summary = Pipeline::new(&store, config, RetryConfig::none())
      .run(RunContext::at(t0() + Duration::days(9)), &[snapshot("B")], &[], &CancelFlag::new())
      .await;
    assert_eq!(summary.closing_at, effective);

    let current = store.current_version(&customer(), &e1()).await.unwrap().unwrap();
    assert_eq!(current.valid_from, effective);
  }

  #[tokio::test]
  async fn rebinding_the_same_events_is_idempotent() {
    let store = MemoryStore::new();
    let events: Vec<EventRecord> = (0..1000)
      .map(|i| event(&format!("S{i:04}"), "E1", t0() + Duration::minutes(i), 100 + i))
      .collect();

    let first = pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &events, &CancelFlag::new())
      .await;
    let count_after_first = store.fact_count().await.unwrap();
    let total_after_first = store
      .current_version(&customer(), &e1())
      .await
      .unwrap()
      .unwrap()
      .metrics;

    let second = pipeline(&store)
      .run(RunContext::at(t0() + Duration::days(1)), &[snapshot("A")], &events, &CancelFlag::new())
      .await;

    assert_eq!(first.binder.bound, 1000);
    assert_eq!(second.binder.bound, 0);
    assert_eq!(second.binder.duplicates, 1000);
    assert_eq!(store.fact_count().await.unwrap(), count_after_first);
    let total_after_second = store
      .current_version(&customer(), &e1())
      .await
      .unwrap()
      .unwrap()
      .metrics;
    assert_eq!(total_after_first, total_after_second);
    assert_eq!(total_after_second.event_count, 1000);
  }

  #[tokio::test]
  async fn cancelled_run_is_incomplete_and_skips_rollup() {
    let store = MemoryStore::new();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let summary = pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &[], &cancel)
      .await;
    assert_eq!(summary.status, RunStatus::Incomplete);
    assert!(summary.rollup.is_none());
  }

  #[tokio::test]
  async fn invariant_violation_downgrades_to_incomplete() {
    let store = MemoryStore::new();
    pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &[], &CancelFlag::new())
      .await;

    // Closing a year before E1 existed.
    let config = PipelineConfig {
      effective_date: Some(t0() - Duration::days(365)),
      ..Default::default()
    };
    let other = Snapshot::new(customer(), "E2")
      .tracked("address", "Z")
      .originated_at(t0());
    let summary = Pipeline::new(&store, config, RetryConfig::none())
      .run(RunContext::at(t0()), &[snapshot("B"), other], &[], &CancelFlag::new())
      .await;

    assert_eq!(summary.status, RunStatus::Incomplete);
    assert_eq!(summary.writer.invariant_violations, 1);
    assert_eq!(summary.writer.created, 1);
  }

  #[tokio::test]
  async fn exhausted_store_retries_fail_the_run() {
    let store = MemoryStore::new();
    store.fail_next(100);
    let summary = pipeline(&store)
      .run(RunContext::at(t0()), &[snapshot("A")], &[], &CancelFlag::new())
      .await;
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.failure.is_some());
  }

  #[tokio::test]
  async fn responses_and_aggregates_follow_the_events() {
    let store = MemoryStore::new();
    let product = Dimension::new("product");
    let campaign = Dimension::new("campaign");
    let snapshots = [
      snapshot("A"),
      Snapshot::new(product.clone(), "P1")
        .tracked("category", "tools")
        .untracked("unit_cost", "4.00")
        .originated_at(t0()),
      Snapshot::new(campaign.clone(), "C1").tracked("name", "Spring").originated_at(t0()),
    ];
    let mut sale = event("S1", "E1", t0() + Duration::days(1), 1000);
    sale.refs.push(DimensionRef::new(product.clone(), "P1"));
    let responses = [
      ResponseRecord {
        response_id:      "R1".into(),
        responded_at:     t0() + Duration::days(2),
        customer_key:     "E1".into(),
        campaign_key:     "C1".into(),
        kind:             ResponseKind::Converted,
        conversion_value: Decimal::new(2500, 2),
      },
      ResponseRecord {
        response_id:      "R2".into(),
        responded_at:     t0() + Duration::days(2),
        customer_key:     "E1".into(),
        campaign_key:     "C9".into(),
        kind:             ResponseKind::Opened,
        conversion_value: Decimal::ZERO,
      },
    ];

    let input = RunInput {
      snapshots: &snapshots,
      events: &[sale],
      responses: &responses,
      rejected_rows: 0,
    };
    let summary = pipeline(&store).run_with(RunContext::at(t0()), input, &CancelFlag::new()).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.binder.bound, 1);
    assert_eq!((summary.responses.bound, summary.responses.rejected), (1, 1));
    assert_eq!(summary.orphans, 1);
    assert_eq!(store.orphans().await[0].1.event_id, "R2");
    assert_eq!(
      summary.aggregates,
      Some(AggregateTally { customer_months: 1, product_days: 1 })
    );

    let [day] = store.product_daily().await.unwrap().try_into().unwrap();
    assert_eq!(day.cost, Some(Decimal::new(400, 2)));
    assert_eq!(day.profit, Some(Decimal::new(600, 2)));
    let [month] = store.customer_monthly().await.unwrap().try_into().unwrap();
    assert_eq!(month.year_month, 202401);
    assert_eq!(month.net_total, Decimal::new(1000, 2));
  }

  #[tokio::test]
  async fn feed_rejections_are_carried_into_the_summary() {
    let store = MemoryStore::new();
    let input = RunInput { rejected_rows: 3, ..RunInput::default() };
    let summary = pipeline(&store).run_with(RunContext::at(t0()), input, &CancelFlag::new()).await;
    assert_eq!(summary.rejected_rows, 3);
    assert_eq!(summary.status, RunStatus::Success);
  }

  #[test]
  fn summaries_written_before_newer_fields_still_load() {
    let summary = RunSummary {
      run_id:        Uuid::new_v4(),
      started_at:    t0(),
      finished_at:   t0(),
      run_at:        t0(),
      closing_at:    t0(),
      rejected_rows: 4,
      writer:        WriterTally::default(),
      binder:        BindTally::default(),
      responses:     BindTally::default(),
      orphans:       0,
      rollup:        None,
      aggregates:    None,
      status:        RunStatus::Success,
      failure:       None,
    };
    let mut json = serde_json::to_value(&summary).unwrap();
    let fields = json.as_object_mut().unwrap();
    for newer in ["rejected_rows", "responses", "aggregates"] {
      fields.remove(newer);
    }
    let loaded: RunSummary = serde_json::from_value(json).unwrap();
    assert_eq!(loaded.rejected_rows, 0);
    assert_eq!(loaded.responses, BindTally::default());
  }

  #[test]
  fn run_clock_is_cut_to_whole_microseconds() {
    let ctx = RunContext::at(t0() + Duration::nanoseconds(1_500));
    assert_eq!(ctx.run_at, t0() + Duration::microseconds(1));
  }

  #[test]
  fn run_status_strings() {
    assert_eq!(RunStatus::Incomplete.to_string(), "incomplete");
    assert_eq!("failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
  }
}
