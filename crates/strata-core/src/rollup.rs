//! Post-bind aggregation of fact measures onto current dimension versions.
//!
//! For every business key the rollup sums the facts bound to *any* of its
//! versions and writes the total onto the current version. Historical
//! versions are never written to. Run it only after every event in the run
//! has been bound; a partial rollup must not be persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
  Error, Result,
  dimension::{Dimension, DimensionVersion, EntityMetrics, SurrogateKey},
  retry::{RetryConfig, retrying},
  store::{DimensionStore, FactStore},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupTally {
  /// Business keys whose metrics were recomputed.
  pub entities:             u64,
  /// Of those, keys whose stored metrics actually changed.
  pub updated:              u64,
  pub invariant_violations: u64,
}

/// Recompute metrics for every entity in every dimension of the store.
pub async fn rollup<S>(store: &S, retry: &RetryConfig) -> Result<RollupTally>
where
  S: DimensionStore + FactStore,
{
  let dimensions = retrying(retry, "dimensions", || store.dimensions()).await?;
  let mut tally = RollupTally::default();
  for dimension in &dimensions {
    rollup_dimension(store, retry, dimension, &mut tally).await?;
  }
  info!(
    entities = tally.entities,
    updated = tally.updated,
    invariant_violations = tally.invariant_violations,
    "rollup finished"
  );
  Ok(tally)
}

async fn rollup_dimension<S>(
  store: &S,
  retry: &RetryConfig,
  dimension: &Dimension,
  tally: &mut RollupTally,
) -> Result<()>
where
  S: DimensionStore + FactStore,
{
  let totals: HashMap<SurrogateKey, EntityMetrics> =
    retrying(retry, "totals_by_surrogate", || store.totals_by_surrogate(dimension))
      .await?
      .into_iter()
      .collect();
  let versions = retrying(retry, "versions", || store.versions(dimension)).await?;

  // `versions` is ordered by business key, so each key is one contiguous run.
  for entity in versions.chunk_by(|a, b| a.business_key == b.business_key) {
    match rollup_entity(store, retry, entity, &totals).await {
      Ok(changed) => {
        tally.entities += 1;
        if changed {
          tally.updated += 1;
        }
      }
      Err(e) if e.is_per_entity() => {
        error!(%dimension, business_key = %entity[0].business_key, error = %e, "rollup skipped entity");
        tally.invariant_violations += 1;
      }
      Err(e) => return Err(e),
    }
  }
  Ok(())
}

/// Returns whether the stored metrics changed.
async fn rollup_entity<S>(
  store: &S,
  retry: &RetryConfig,
  entity: &[DimensionVersion],
  totals: &HashMap<SurrogateKey, EntityMetrics>,
) -> Result<bool>
where
  S: DimensionStore + FactStore,
{
  let first = &entity[0];
  let mut current = entity.iter().filter(|v| v.is_current);
  let current = match (current.next(), current.next()) {
    (Some(v), None) => v,
    (None, _) => {
      return Err(Error::invariant(
        &first.dimension,
        &first.business_key,
        "no current version to receive metrics",
      ));
    }
    (Some(_), Some(_)) => {
      return Err(Error::invariant(
        &first.dimension,
        &first.business_key,
        "more than one current version",
      ));
    }
  };

  let mut metrics = EntityMetrics::default();
  for version in entity {
    if let Some(partial) = totals.get(&version.surrogate_key) {
      metrics = metrics.checked_merge(partial).ok_or_else(|| {
        Error::invariant(&first.dimension, &first.business_key, "metrics overflow")
      })?;
    }
  }

  if metrics == current.metrics {
    return Ok(false);
  }

  let surrogate_key = current.surrogate_key;
  retrying(retry, "write_metrics", || store.write_metrics(surrogate_key, metrics.clone())).await?;
  debug!(
    dimension = %current.dimension,
    business_key = %current.business_key,
    %surrogate_key,
    event_count = metrics.event_count,
    total_amount = %metrics.total_amount,
    "wrote metrics"
  );
  Ok(true)
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use chrono::{DateTime, TimeZone, Utc};
  use rust_decimal::Decimal;

  use super::*;
  use crate::{
    dimension::BusinessKey,
    event::{FactRecord, Measures},
    memory::MemoryStore,
    run::CancelFlag,
    snapshot::Snapshot,
    writer::VersionWriter,
  };

  fn t(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 9, day, 0, 0, 0).unwrap() }

  fn fact(id: &str, sk: SurrogateKey, amount: i64) -> FactRecord {
    let mut keys = BTreeMap::new();
    keys.insert(Dimension::new("customer"), sk);
    FactRecord {
      event_id: id.into(),
      occurred_at: t(3),
      date_key: 20240903,
      keys,
      measures: Measures { gross_amount: Decimal::new(amount, 0), ..Default::default() },
      net_amount: Decimal::new(amount, 0),
      bound_at: t(3),
    }
  }

  #[tokio::test]
  async fn totals_span_all_versions_and_land_on_current() {
    let store = MemoryStore::new();
    let dim = Dimension::new("customer");
    let mut w = VersionWriter::new(&store, t(2), RetryConfig::none());
    w.apply_batch(
      &[Snapshot::new(dim.clone(), "E1").tracked("address", "A").originated_at(t(1))],
      &CancelFlag::new(),
    )
    .await
    .unwrap();
    let mut w = VersionWriter::new(&store, t(10), RetryConfig::none());
    w.apply_batch(&[Snapshot::new(dim.clone(), "E1").tracked("address", "B")], &CancelFlag::new())
      .await
      .unwrap();

    let key = BusinessKey::new("E1").unwrap();
    let history = store.history(&dim, &key).await.unwrap();
    let (old, new) = (history[0].surrogate_key, history[1].surrogate_key);
    store.insert_fact(&fact("F1", old, 10)).await.unwrap();
    store.insert_fact(&fact("F2", old, 15)).await.unwrap();
    store.insert_fact(&fact("F3", new, 5)).await.unwrap();

    let tally = rollup(&store, &RetryConfig::none()).await.unwrap();
    assert_eq!(tally.entities, 1);
    assert_eq!(tally.updated, 1);

    let history = store.history(&dim, &key).await.unwrap();
    assert_eq!(history[0].metrics, EntityMetrics::default());
    assert_eq!(
      history[1].metrics,
      EntityMetrics { event_count: 3, total_amount: Decimal::new(30, 0) }
    );

    // Unchanged facts leave nothing to write.
    let again = rollup(&store, &RetryConfig::none()).await.unwrap();
    assert_eq!(again.updated, 0);
  }
}
