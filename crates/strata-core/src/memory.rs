//! [`MemoryStore`]: an in-process implementation of every store trait.
//!
//! Used for dry runs and as the reference backend in tests. It enforces the
//! same invariants as the SQLite backend: one current version per key, no
//! overlapping intervals on insert, metrics only on current versions.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
  Error, Result,
  aggregate::{Aggregates, CustomerMonth, ProductDay},
  dimension::{
    Attributes, BusinessKey, Dimension, DimensionVersion, EntityMetrics, NewVersion,
    SurrogateKey, ValidTo, Validity, VersionLookup, select_at,
  },
  event::{FactRecord, Orphan},
  response::ResponseFact,
  store::{AggregateStore, DimensionStore, FactStore, ResponseStore, StoreBackend},
};

#[derive(Default)]
struct State {
  versions:   Vec<DimensionVersion>,
  last_key:   i64,
  facts:      BTreeMap<String, FactRecord>,
  orphans:    Vec<(Uuid, Orphan)>,
  responses:  BTreeMap<String, ResponseFact>,
  aggregates: Aggregates,
}

impl State {
  fn key_versions(&self, dimension: &Dimension, key: &BusinessKey) -> Vec<DimensionVersion> {
    let mut versions: Vec<DimensionVersion> = self
      .versions
      .iter()
      .filter(|v| &v.dimension == dimension && &v.business_key == key)
      .cloned()
      .collect();
    versions.sort_by_key(|v| (v.valid_from, v.surrogate_key));
    versions
  }

  fn current_index(&self, dimension: &Dimension, key: &BusinessKey) -> Result<Option<usize>> {
    let mut found = self
      .versions
      .iter()
      .enumerate()
      .filter(|(_, v)| v.is_current && &v.dimension == dimension && &v.business_key == key)
      .map(|(i, _)| i);
    match (found.next(), found.next()) {
      (None, _) => Ok(None),
      (Some(i), None) => Ok(Some(i)),
      (Some(_), Some(_)) => Err(Error::invariant(dimension, key, "more than one current version")),
    }
  }

  fn index_of(&self, surrogate_key: SurrogateKey) -> Result<usize> {
    self
      .versions
      .iter()
      .position(|v| v.surrogate_key == surrogate_key)
      .ok_or(Error::VersionNotFound(surrogate_key))
  }

  fn close(&mut self, index: usize, closing_at: DateTime<Utc>) -> Result<DimensionVersion> {
    let version = &mut self.versions[index];
    if closing_at < version.valid_from {
      return Err(Error::invariant(
        &version.dimension,
        &version.business_key,
        format!(
          "closing {} at {} precedes its valid_from {}",
          version.surrogate_key,
          closing_at.to_rfc3339(),
          version.valid_from.to_rfc3339()
        ),
      ));
    }
    version.valid_to = ValidTo::At(closing_at);
    version.is_current = false;
    version.updated_at = Utc::now();
    Ok(version.clone())
  }

  fn insert(&mut self, new: NewVersion) -> Result<DimensionVersion> {
    if self.current_index(&new.dimension, &new.business_key)?.is_some() {
      return Err(Error::invariant(
        &new.dimension,
        &new.business_key,
        "insert while a current version exists",
      ));
    }

    let candidate = Validity { from: new.valid_from, to: ValidTo::Open };
    if let Some(clash) = self
      .versions
      .iter()
      .filter(|v| v.dimension == new.dimension && v.business_key == new.business_key)
      .find(|v| v.validity().overlaps(&candidate))
    {
      return Err(Error::invariant(
        &new.dimension,
        &new.business_key,
        format!("new version would overlap {}", clash.surrogate_key),
      ));
    }

    self.last_key += 1;
    let now = Utc::now();
    let version = DimensionVersion {
      surrogate_key: SurrogateKey(self.last_key),
      dimension:     new.dimension,
      business_key:  new.business_key,
      tracked:       new.tracked,
      untracked:     new.untracked,
      valid_from:    new.valid_from,
      valid_to:      ValidTo::Open,
      is_current:    true,
      metrics:       new.metrics,
      recorded_at:   now,
      updated_at:    now,
    };
    self.versions.push(version.clone());
    Ok(version)
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A store held entirely in memory. Not durable.
#[derive(Default)]
pub struct MemoryStore {
  state:              RwLock<State>,
  transient_failures: AtomicU32,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  /// Make the next `count` store calls fail with
  /// [`Error::StoreUnavailable`].
  pub fn fail_next(&self, count: u32) {
    self.transient_failures.store(count, Ordering::SeqCst);
  }

  /// The orphan log, in insertion order.
  pub async fn orphans(&self) -> Vec<(Uuid, Orphan)> {
    self.state.read().await.orphans.clone()
  }

  fn check_available(&self) -> Result<()> {
    let injected = self
      .transient_failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if injected {
      return Err(Error::StoreUnavailable("injected transient failure".into()));
    }
    Ok(())
  }
}

impl StoreBackend for MemoryStore {
  type Error = Error;
}

impl DimensionStore for MemoryStore {
  async fn current_version(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
  ) -> Result<Option<DimensionVersion>> {
    self.check_available()?;
    let state = self.state.read().await;
    Ok(state.current_index(dimension, key)?.map(|i| state.versions[i].clone()))
  }

  async fn version_at(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
    at: DateTime<Utc>,
  ) -> Result<VersionLookup> {
    self.check_available()?;
    let state = self.state.read().await;
    select_at(dimension, key, &state.key_versions(dimension, key), at)
  }

  async fn insert_version(&self, version: NewVersion) -> Result<DimensionVersion> {
    self.check_available()?;
    self.state.write().await.insert(version)
  }

  async fn close_current_version(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
    closing_at: DateTime<Utc>,
  ) -> Result<DimensionVersion> {
    self.check_available()?;
    let mut state = self.state.write().await;
    let index = state
      .current_index(dimension, key)?
      .ok_or_else(|| Error::invariant(dimension, key, "no current version to close"))?;
    state.close(index, closing_at)
  }

  async fn supersede_current(
    &self,
    successor: NewVersion,
  ) -> Result<(DimensionVersion, DimensionVersion)> {
    self.check_available()?;
    let mut state = self.state.write().await;
    let index = state
      .current_index(&successor.dimension, &successor.business_key)?
      .ok_or_else(|| {
        Error::invariant(
          &successor.dimension,
          &successor.business_key,
          "no current version to supersede",
        )
      })?;

    // A rejected insert restores the closed version.
    let before = state.versions[index].clone();
    let closed = state.close(index, successor.valid_from)?;
    match state.insert(successor) {
      Ok(opened) => Ok((closed, opened)),
      Err(e) => {
        state.versions[index] = before;
        Err(e)
      }
    }
  }

  async fn update_untracked(
    &self,
    surrogate_key: SurrogateKey,
    untracked: Attributes,
  ) -> Result<DimensionVersion> {
    self.check_available()?;
    let mut state = self.state.write().await;
    let index = state.index_of(surrogate_key)?;
    let version = &mut state.versions[index];
    if !version.is_current {
      return Err(Error::NotCurrent(surrogate_key));
    }
    version.untracked = untracked;
    version.updated_at = Utc::now();
    Ok(version.clone())
  }

  async fn write_metrics(
    &self,
    surrogate_key: SurrogateKey,
    metrics: EntityMetrics,
  ) -> Result<()> {
    self.check_available()?;
    let mut state = self.state.write().await;
    let index = state.index_of(surrogate_key)?;
    let version = &mut state.versions[index];
    if !version.is_current {
      return Err(Error::NotCurrent(surrogate_key));
    }
    version.metrics = metrics;
    version.updated_at = Utc::now();
    Ok(())
  }

  async fn history(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
  ) -> Result<Vec<DimensionVersion>> {
    self.check_available()?;
    Ok(self.state.read().await.key_versions(dimension, key))
  }

  async fn versions(&self, dimension: &Dimension) -> Result<Vec<DimensionVersion>> {
    self.check_available()?;
    let state = self.state.read().await;
    let mut versions: Vec<DimensionVersion> = state
      .versions
      .iter()
      .filter(|v| &v.dimension == dimension)
      .cloned()
      .collect();
    versions.sort_by(|a, b| {
      (&a.business_key, a.valid_from, a.surrogate_key)
        .cmp(&(&b.business_key, b.valid_from, b.surrogate_key))
    });
    Ok(versions)
  }

  async fn business_keys(&self, dimension: &Dimension) -> Result<Vec<BusinessKey>> {
    self.check_available()?;
    let state = self.state.read().await;
    let keys: BTreeSet<BusinessKey> = state
      .versions
      .iter()
      .filter(|v| &v.dimension == dimension)
      .map(|v| v.business_key.clone())
      .collect();
    Ok(keys.into_iter().collect())
  }

  async fn dimensions(&self) -> Result<Vec<Dimension>> {
    self.check_available()?;
    let state = self.state.read().await;
    let dims: BTreeSet<Dimension> =
      state.versions.iter().map(|v| v.dimension.clone()).collect();
    Ok(dims.into_iter().collect())
  }
}

impl FactStore for MemoryStore {
  async fn contains_fact(&self, event_id: &str) -> Result<bool> {
    self.check_available()?;
    Ok(self.state.read().await.facts.contains_key(event_id))
  }

  async fn insert_fact(&self, fact: &FactRecord) -> Result<bool> {
    self.check_available()?;
    let mut state = self.state.write().await;
    if state.facts.contains_key(&fact.event_id) {
      return Ok(false);
    }
    state.facts.insert(fact.event_id.clone(), fact.clone());
    Ok(true)
  }

  async fn totals_by_surrogate(
    &self,
    dimension: &Dimension,
  ) -> Result<Vec<(SurrogateKey, EntityMetrics)>> {
    self.check_available()?;
    let state = self.state.read().await;
    let mut totals: BTreeMap<SurrogateKey, EntityMetrics> = BTreeMap::new();
    for fact in state.facts.values() {
      let Some(sk) = fact.keys.get(dimension) else { continue };
      let entry = totals.entry(*sk).or_default();
      *entry = entry.checked_add_event(fact.net_amount).ok_or_else(|| {
        Error::Store(format!("decimal overflow summing facts for {sk}").into())
      })?;
    }
    Ok(totals.into_iter().collect())
  }

  async fn fact_count(&self) -> Result<u64> {
    self.check_available()?;
    Ok(self.state.read().await.facts.len() as u64)
  }

  async fn facts(&self) -> Result<Vec<FactRecord>> {
    self.check_available()?;
    Ok(self.state.read().await.facts.values().cloned().collect())
  }

  async fn record_orphans(&self, run_id: Uuid, orphans: &[Orphan]) -> Result<()> {
    self.check_available()?;
    let mut state = self.state.write().await;
    state
      .orphans
      .extend(orphans.iter().cloned().map(|orphan| (run_id, orphan)));
    Ok(())
  }
}

impl ResponseStore for MemoryStore {
  async fn contains_response(&self, response_id: &str) -> Result<bool> {
    self.check_available()?;
    Ok(self.state.read().await.responses.contains_key(response_id))
  }

  async fn insert_response(&self, response: &ResponseFact) -> Result<bool> {
    self.check_available()?;
    let mut state = self.state.write().await;
    if state.responses.contains_key(&response.response_id) {
      return Ok(false);
    }
    state.responses.insert(response.response_id.clone(), response.clone());
    Ok(true)
  }

  async fn responses(&self) -> Result<Vec<ResponseFact>> {
    self.check_available()?;
    Ok(self.state.read().await.responses.values().cloned().collect())
  }
}

impl AggregateStore for MemoryStore {
  async fn replace_aggregates(&self, aggregates: &Aggregates) -> Result<()> {
    self.check_available()?;
    self.state.write().await.aggregates = aggregates.clone();
    Ok(())
  }

  async fn customer_monthly(&self) -> Result<Vec<CustomerMonth>> {
    self.check_available()?;
    Ok(self.state.read().await.aggregates.customer_monthly.clone())
  }

  async fn product_daily(&self) -> Result<Vec<ProductDay>> {
    self.check_available()?;
    Ok(self.state.read().await.aggregates.product_daily.clone())
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
  }

  fn new_version(key: &str, from: DateTime<Utc>) -> NewVersion {
    NewVersion {
      dimension:    Dimension::new("customer"),
      business_key: BusinessKey::new(key).unwrap(),
      tracked:      Attributes::new(),
      untracked:    Attributes::new(),
      valid_from:   from,
      metrics:      EntityMetrics::default(),
    }
  }

  #[tokio::test]
  async fn surrogate_keys_increase_and_are_unique() {
    let store = MemoryStore::new();
    let a = store.insert_version(new_version("A", ts(1))).await.unwrap();
    let b = store.insert_version(new_version("B", ts(1))).await.unwrap();
    assert!(b.surrogate_key > a.surrogate_key);
  }

  #[tokio::test]
  async fn insert_rejects_second_current_version() {
    let store = MemoryStore::new();
    store.insert_version(new_version("A", ts(1))).await.unwrap();
    let err = store.insert_version(new_version("A", ts(3))).await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation { .. }));
  }

  #[tokio::test]
  async fn close_without_current_is_invariant_violation() {
    let store = MemoryStore::new();
    let dim = Dimension::new("customer");
    let key = BusinessKey::new("missing").unwrap();
    let err = store.close_current_version(&dim, &key, ts(2)).await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation { .. }));
  }

  #[tokio::test]
  async fn supersede_failure_leaves_current_untouched() {
    let store = MemoryStore::new();
    let first = store.insert_version(new_version("A", ts(5))).await.unwrap();

    // Closing before valid_from is rejected.
    let err = store.supersede_current(new_version("A", ts(2))).await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation { .. }));

    let current = store
      .current_version(&first.dimension, &first.business_key)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(current.surrogate_key, first.surrogate_key);
    assert!(current.valid_to.is_open());
  }

  #[tokio::test]
  async fn version_at_distinguishes_unknown_from_out_of_range() {
    let store = MemoryStore::new();
    let v = store.insert_version(new_version("A", ts(10))).await.unwrap();

    let before = store.version_at(&v.dimension, &v.business_key, ts(2)).await.unwrap();
    assert_eq!(before, VersionLookup::OutOfRange);

    let other = BusinessKey::new("Z").unwrap();
    let unknown = store.version_at(&v.dimension, &other, ts(12)).await.unwrap();
    assert_eq!(unknown, VersionLookup::UnknownKey);
  }

  #[tokio::test]
  async fn metrics_only_on_current_version() {
    let store = MemoryStore::new();
    store.insert_version(new_version("A", ts(1))).await.unwrap();
    let (closed, opened) = store.supersede_current(new_version("A", ts(4))).await.unwrap();

    let err = store
      .write_metrics(closed.surrogate_key, EntityMetrics::default())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NotCurrent(_)));
    store
      .write_metrics(opened.surrogate_key, EntityMetrics::default())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn injected_failures_are_transient() {
    let store = MemoryStore::new();
    store.fail_next(1);
    assert!(store.fact_count().await.unwrap_err().is_transient());
    assert_eq!(store.fact_count().await.unwrap(), 0);
  }
}
