//! The version writer: applies attribute snapshots to the dimension store.
//!
//! For each snapshot the writer looks up the key's current version and picks
//! one of four outcomes:
//!
//! - no current version: originate the entity at its origination timestamp;
//! - tracked attributes differ: supersede the current version at the closing
//!   timestamp, carrying its metrics forward;
//! - only untracked attributes differ: correct the current version in place;
//! - otherwise: nothing to do.
//!
//! The closing timestamp is fixed for the whole run (the configured effective
//! date, else the run timestamp). Changes are never back-dated from the data,
//! so two changes seen in different runs get run-dependent boundaries even if
//! the real-world change happened earlier.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  dimension::{
    BusinessKey, Dimension, DimensionVersion, EntityMetrics, NewVersion, SurrogateKey,
    to_store_precision,
  },
  retry::{RetryConfig, retrying},
  run::{CancelFlag, Progress},
  snapshot::Snapshot,
  store::DimensionStore,
};

/// Writer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
  /// Closing timestamp for every change in a run. Defaults to the run
  /// timestamp when unset.
  pub effective_date: Option<DateTime<Utc>>,
}

impl WriterConfig {
  /// Truncated to whole microseconds, the finest boundary a store keeps.
  pub fn closing_at(&self, run_at: DateTime<Utc>) -> DateTime<Utc> {
    to_store_precision(self.effective_date.unwrap_or(run_at))
  }
}

/// What applying one snapshot did.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  Created(DimensionVersion),
  Versioned { closed: DimensionVersion, opened: DimensionVersion },
  UpdatedInPlace(DimensionVersion),
  Unchanged(SurrogateKey),
  /// The key hit an invariant violation earlier in this run.
  Skipped,
}

/// Per-outcome counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterTally {
  pub created:              u64,
  pub versioned:            u64,
  pub updated_in_place:     u64,
  pub unchanged:            u64,
  pub skipped:              u64,
  pub malformed:            u64,
  pub invariant_violations: u64,
}

pub struct VersionWriter<'s, S> {
  store:      &'s S,
  retry:      RetryConfig,
  closing_at: DateTime<Utc>,
  poisoned:   HashSet<(Dimension, BusinessKey)>,
  tally:      WriterTally,
}

impl<'s, S: DimensionStore> VersionWriter<'s, S> {
  pub fn new(store: &'s S, closing_at: DateTime<Utc>, retry: RetryConfig) -> Self {
    let closing_at = to_store_precision(closing_at);
    Self { store, retry, closing_at, poisoned: HashSet::new(), tally: WriterTally::default() }
  }

  pub fn closing_at(&self) -> DateTime<Utc> { self.closing_at }

  pub fn tally(&self) -> WriterTally { self.tally }

  /// Apply one snapshot. Successful outcomes are counted; errors are returned
  /// to the caller unclassified.
  pub async fn apply(&mut self, snapshot: &Snapshot) -> Result<WriteOutcome> {
    let dimension = &snapshot.dimension;
    let key = BusinessKey::new(&snapshot.business_key).map_err(|_| {
      Error::MalformedInput(format!("{dimension} snapshot has no business key"))
    })?;

    if self.poisoned.contains(&(dimension.clone(), key.clone())) {
      debug!(%dimension, business_key = %key, "skipping key with earlier invariant violation");
      self.tally.skipped += 1;
      return Ok(WriteOutcome::Skipped);
    }

    let store = self.store;
    let current =
      retrying(&self.retry, "current_version", || store.current_version(dimension, &key)).await?;

    let outcome = match current {
      None => self.originate(snapshot, key).await?,
      Some(current) => self.reconcile(snapshot, current).await?,
    };

    match &outcome {
      WriteOutcome::Created(_) => self.tally.created += 1,
      WriteOutcome::Versioned { .. } => self.tally.versioned += 1,
      WriteOutcome::UpdatedInPlace(_) => self.tally.updated_in_place += 1,
      WriteOutcome::Unchanged(_) => self.tally.unchanged += 1,
      WriteOutcome::Skipped => self.tally.skipped += 1,
    }
    Ok(outcome)
  }

  /// Apply snapshots in input order until done or cancelled.
  ///
  /// Malformed snapshots are counted and skipped. An invariant violation
  /// abandons that key for the rest of the run. Any other error ends the
  /// batch.
  pub async fn apply_batch<'a, I>(&mut self, snapshots: I, cancel: &CancelFlag) -> Result<Progress>
  where
    I: IntoIterator<Item = &'a Snapshot>,
  {
    for snapshot in snapshots {
      if cancel.is_cancelled() {
        info!("version writer cancelled");
        return Ok(Progress::Cancelled);
      }

      match self.apply(snapshot).await {
        Ok(_) => {}
        Err(e) if e.is_per_record() => {
          warn!(
            dimension = %snapshot.dimension,
            business_key = %snapshot.business_key,
            error = %e,
            "skipping malformed snapshot"
          );
          self.tally.malformed += 1;
        }
        Err(e) if e.is_per_entity() => {
          error!(
            dimension = %snapshot.dimension,
            business_key = %snapshot.business_key,
            error = %e,
            "abandoning key for this run"
          );
          self.tally.invariant_violations += 1;
          if let Ok(key) = BusinessKey::new(&snapshot.business_key) {
            self.poisoned.insert((snapshot.dimension.clone(), key));
          }
        }
        Err(e) => return Err(e),
      }
    }
    Ok(Progress::Completed)
  }

  async fn originate(&self, snapshot: &Snapshot, key: BusinessKey) -> Result<WriteOutcome> {
    let dimension = &snapshot.dimension;
    let store = self.store;

    // A key with history but no current version is a broken chain, not a new
    // entity.
    let history = retrying(&self.retry, "history", || store.history(dimension, &key)).await?;
    if !history.is_empty() {
      return Err(Error::invariant(
        dimension,
        &key,
        format!("{} versions but none is current", history.len()),
      ));
    }

    let valid_from = snapshot.originated_at.map(to_store_precision).ok_or_else(|| {
      Error::MalformedInput(format!(
        "{dimension}/{key} is new but has no origination timestamp"
      ))
    })?;

    let new = NewVersion {
      dimension: dimension.clone(),
      business_key: key,
      tracked: snapshot.tracked.clone(),
      untracked: snapshot.untracked.clone(),
      valid_from,
      metrics: EntityMetrics::default(),
    };
    let created =
      retrying(&self.retry, "insert_version", || store.insert_version(new.clone())).await?;

    debug!(
      %dimension,
      business_key = %created.business_key,
      surrogate_key = %created.surrogate_key,
      valid_from = %created.valid_from.to_rfc3339(),
      "originated entity"
    );
    Ok(WriteOutcome::Created(created))
  }

  async fn reconcile(
    &self,
    snapshot: &Snapshot,
    current: DimensionVersion,
  ) -> Result<WriteOutcome> {
    let store = self.store;

    if snapshot.tracked != current.tracked {
      if self.closing_at < current.valid_from {
        return Err(Error::invariant(
          &current.dimension,
          &current.business_key,
          format!(
            "closing timestamp {} precedes valid_from {} of {}",
            self.closing_at.to_rfc3339(),
            current.valid_from.to_rfc3339(),
            current.surrogate_key
          ),
        ));
      }

      let successor = NewVersion {
        dimension:    current.dimension.clone(),
        business_key: current.business_key.clone(),
        tracked:      snapshot.tracked.clone(),
        untracked:    snapshot.untracked.clone(),
        valid_from:   self.closing_at,
        metrics:      current.metrics.clone(),
      };
      let (closed, opened) = retrying(&self.retry, "supersede_current", || {
        store.supersede_current(successor.clone())
      })
      .await?;

      debug!(
        dimension = %opened.dimension,
        business_key = %opened.business_key,
        closed = %closed.surrogate_key,
        opened = %opened.surrogate_key,
        "tracked attributes changed"
      );
      return Ok(WriteOutcome::Versioned { closed, opened });
    }

    if snapshot.untracked != current.untracked {
      let updated = retrying(&self.retry, "update_untracked", || {
        store.update_untracked(current.surrogate_key, snapshot.untracked.clone())
      })
      .await?;
      debug!(
        dimension = %updated.dimension,
        business_key = %updated.business_key,
        surrogate_key = %updated.surrogate_key,
        "corrected untracked attributes"
      );
      return Ok(WriteOutcome::UpdatedInPlace(updated));
    }

    Ok(WriteOutcome::Unchanged(current.surrogate_key))
  }
}
