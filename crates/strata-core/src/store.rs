//! The store traits: `DimensionStore`, `FactStore`, `ResponseStore` and
//! `AggregateStore`.
//!
//! The traits are implemented by storage backends (e.g. `strata-store-sqlite`
//! and [`crate::memory::MemoryStore`]). The engine depends on this
//! abstraction, not on any concrete backend.
//!
//! All methods return `Send` futures so the traits can be used in
//! multi-threaded async runtimes.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  aggregate::{Aggregates, CustomerMonth, ProductDay},
  dimension::{
    Attributes, BusinessKey, Dimension, DimensionVersion, EntityMetrics, NewVersion,
    SurrogateKey, VersionLookup,
  },
  event::{FactRecord, Orphan},
  response::ResponseFact,
};

/// The error type shared by every trait a backend implements.
///
/// Backend errors must convert into [`crate::Error`]; transient I/O failures
/// must become [`crate::Error::StoreUnavailable`] so the engine retries them.
pub trait StoreBackend: Send + Sync {
  type Error: Into<crate::Error> + std::error::Error + Send + Sync + 'static;
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

/// Durable storage for every version of every entity.
///
/// Versions are never deleted. The only mutations are closing the current
/// version, correcting untracked attributes in place, and writing rollup
/// metrics onto current versions.
pub trait DimensionStore: StoreBackend {
  /// The version with `is_current = true`, or `None` if the key is unknown.
  fn current_version<'a>(
    &'a self,
    dimension: &'a Dimension,
    key: &'a BusinessKey,
  ) -> impl Future<Output = Result<Option<DimensionVersion>, Self::Error>> + Send + 'a;

  /// The version whose `[valid_from, valid_to)` contains `at`.
  ///
  /// Distinguishes an unknown key from a known key with no matching interval.
  /// More than one match is an invariant violation, never a result.
  fn version_at<'a>(
    &'a self,
    dimension: &'a Dimension,
    key: &'a BusinessKey,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<VersionLookup, Self::Error>> + Send + 'a;

  /// Append a new current version and return it with its surrogate key.
  ///
  /// The caller guarantees the key has no current version.
  fn insert_version(
    &self,
    version: NewVersion,
  ) -> impl Future<Output = Result<DimensionVersion, Self::Error>> + Send + '_;

  /// Set `valid_to = closing_at` and `is_current = false` on the current
  /// version. Fails with an invariant violation if there is none.
  fn close_current_version<'a>(
    &'a self,
    dimension: &'a Dimension,
    key: &'a BusinessKey,
    closing_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<DimensionVersion, Self::Error>> + Send + 'a;

  /// Close the current version at `successor.valid_from` and insert
  /// `successor` as one atomic step. Returns `(closed, opened)`.
  fn supersede_current(
    &self,
    successor: NewVersion,
  ) -> impl Future<Output = Result<(DimensionVersion, DimensionVersion), Self::Error>>
  + Send
  + '_;

  /// Overwrite the untracked attributes of a version in place.
  fn update_untracked(
    &self,
    surrogate_key: SurrogateKey,
    untracked: Attributes,
  ) -> impl Future<Output = Result<DimensionVersion, Self::Error>> + Send + '_;

  /// Write rollup metrics onto a version. Rejects closed versions.
  fn write_metrics(
    &self,
    surrogate_key: SurrogateKey,
    metrics: EntityMetrics,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// All versions of a key, ordered by `valid_from` then surrogate key.
  fn history<'a>(
    &'a self,
    dimension: &'a Dimension,
    key: &'a BusinessKey,
  ) -> impl Future<Output = Result<Vec<DimensionVersion>, Self::Error>> + Send + 'a;

  /// Every version in a dimension, ordered by business key then `valid_from`.
  fn versions<'a>(
    &'a self,
    dimension: &'a Dimension,
  ) -> impl Future<Output = Result<Vec<DimensionVersion>, Self::Error>> + Send + 'a;

  /// Distinct business keys in a dimension, sorted.
  fn business_keys<'a>(
    &'a self,
    dimension: &'a Dimension,
  ) -> impl Future<Output = Result<Vec<BusinessKey>, Self::Error>> + Send + 'a;

  /// Every dimension with at least one version, sorted.
  fn dimensions(
    &self,
  ) -> impl Future<Output = Result<Vec<Dimension>, Self::Error>> + Send + '_;
}

// ─── Facts ───────────────────────────────────────────────────────────────────

/// Storage for bound facts and the orphan log.
pub trait FactStore: StoreBackend {
  /// Whether a fact with this event id has already been stored.
  fn contains_fact<'a>(
    &'a self,
    event_id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Store a fact. Returns `false`, storing nothing, when a fact with the same
  /// event id already exists.
  fn insert_fact<'a>(
    &'a self,
    fact: &'a FactRecord,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Fact count and net amount per surrogate key referenced in `dimension`.
  fn totals_by_surrogate<'a>(
    &'a self,
    dimension: &'a Dimension,
  ) -> impl Future<Output = Result<Vec<(SurrogateKey, EntityMetrics)>, Self::Error>>
  + Send
  + 'a;

  fn fact_count(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Every stored fact, ordered by event id.
  fn facts(&self) -> impl Future<Output = Result<Vec<FactRecord>, Self::Error>> + Send + '_;

  /// Append unresolved references to the orphan log for `run_id`.
  fn record_orphans<'a>(
    &'a self,
    run_id: Uuid,
    orphans: &'a [Orphan],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Campaign responses ──────────────────────────────────────────────────────

/// Storage for bound campaign responses.
pub trait ResponseStore: StoreBackend {
  fn contains_response<'a>(
    &'a self,
    response_id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Store a response. Returns `false`, storing nothing, when one with the same
  /// response id already exists.
  fn insert_response<'a>(
    &'a self,
    response: &'a ResponseFact,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Every stored response, ordered by response id.
  fn responses(
    &self,
  ) -> impl Future<Output = Result<Vec<ResponseFact>, Self::Error>> + Send + '_;
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

/// Storage for the derived aggregate tables. Both are replaced wholesale.
pub trait AggregateStore: StoreBackend {
  /// Replace the contents of both tables in one step.
  fn replace_aggregates<'a>(
    &'a self,
    aggregates: &'a Aggregates,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn customer_monthly(
    &self,
  ) -> impl Future<Output = Result<Vec<CustomerMonth>, Self::Error>> + Send + '_;

  fn product_daily(
    &self,
  ) -> impl Future<Output = Result<Vec<ProductDay>, Self::Error>> + Send + '_;
}
