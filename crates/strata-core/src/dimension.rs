//! Dimension version types: the unit of the temporal dimension store.
//!
//! A business entity (a customer, a product) is stored as one or more
//! *versions*. Each version carries a half-open validity interval
//! `[valid_from, valid_to)`; the version that is still authoritative has
//! `valid_to = ValidTo::Open` and `is_current = true`.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// The name of a dimension, e.g. `customer` or `product`.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Dimension(String);

impl Dimension {
  pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Dimension {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// The stable, source-system identifier of an entity. Never empty.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct BusinessKey(String);

impl BusinessKey {
  /// Validate and wrap a raw key. Surrounding whitespace is trimmed; an empty
  /// key is [`Error::MalformedInput`].
  pub fn new(raw: impl AsRef<str>) -> Result<Self> {
    let trimmed = raw.as_ref().trim();
    if trimmed.is_empty() {
      return Err(Error::MalformedInput("business key is empty".into()));
    }
    Ok(Self(trimmed.to_owned()))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for BusinessKey {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> { Self::new(value) }
}

impl From<BusinessKey> for String {
  fn from(key: BusinessKey) -> Self { key.0 }
}

impl fmt::Display for BusinessKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Store-assigned identifier of one version. Immutable and never reused.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SurrogateKey(pub i64);

impl fmt::Display for SurrogateKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

// ─── Validity ────────────────────────────────────────────────────────────────

/// Upper bound of a validity interval.
///
/// The derived ordering places `Open` after every `At(_)`, so the
/// infinite-future sentinel compares greater than any real timestamp.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum ValidTo {
  At(DateTime<Utc>),
  Open,
}

impl ValidTo {
  pub fn is_open(&self) -> bool { matches!(self, Self::Open) }

  /// `true` if `ts` lies strictly before this bound.
  pub fn is_after(&self, ts: DateTime<Utc>) -> bool {
    match self {
      Self::At(end) => ts < *end,
      Self::Open => true,
    }
  }
}

/// A half-open interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
  pub from: DateTime<Utc>,
  pub to:   ValidTo,
}

impl Validity {
  pub fn contains(&self, ts: DateTime<Utc>) -> bool {
    self.from <= ts && self.to.is_after(ts)
  }

  /// An interval closed at its own start. Produced when one run applies two
  /// tracked changes to the same key; it never contains any instant.
  pub fn is_empty(&self) -> bool { self.to == ValidTo::At(self.from) }

  pub fn is_inverted(&self) -> bool { self.to < ValidTo::At(self.from) }

  pub fn overlaps(&self, other: &Validity) -> bool {
    if self.is_empty() || other.is_empty() {
      return false;
    }
    other.to.is_after(self.from) && self.to.is_after(other.from)
  }
}

/// Drop sub-microsecond digits. Every timestamp is truncated this way before
/// a store sees it, so backends that keep microseconds and backends that keep
/// nanoseconds resolve the same instants to the same versions.
pub fn to_store_precision(ts: DateTime<Utc>) -> DateTime<Utc> { ts.trunc_subsecs(6) }

// ─── Attributes & metrics ────────────────────────────────────────────────────

/// Named attribute values, ordered by name so comparisons are deterministic.
pub type Attributes = BTreeMap<String, String>;

/// Summary metrics accumulated from bound facts.
///
/// Carried forward when a version is superseded and recomputed by
/// [`crate::rollup`] after every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetrics {
  pub event_count:  u64,
  pub total_amount: Decimal,
}

impl EntityMetrics {
  /// Fold one more fact into the metrics. `None` on decimal overflow.
  pub fn checked_add_event(&self, amount: Decimal) -> Option<Self> {
    Some(Self {
      event_count:  self.event_count.checked_add(1)?,
      total_amount: self.total_amount.checked_add(amount)?,
    })
  }

  /// Combine two partial aggregates. `None` on overflow.
  pub fn checked_merge(&self, other: &Self) -> Option<Self> {
    Some(Self {
      event_count:  self.event_count.checked_add(other.event_count)?,
      total_amount: self.total_amount.checked_add(other.total_amount)?,
    })
  }
}

// ─── Versions ────────────────────────────────────────────────────────────────

/// One physical version of a business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVersion {
  pub surrogate_key: SurrogateKey,
  pub dimension:     Dimension,
  pub business_key:  BusinessKey,
  /// History-significant attributes; a change opens a new version.
  pub tracked:       Attributes,
  /// Correction-only attributes; a change is applied in place.
  pub untracked:     Attributes,
  pub valid_from:    DateTime<Utc>,
  pub valid_to:      ValidTo,
  pub is_current:    bool,
  pub metrics:       EntityMetrics,
  /// Store-assigned creation timestamp; never changes.
  pub recorded_at:   DateTime<Utc>,
  pub updated_at:    DateTime<Utc>,
}

impl DimensionVersion {
  pub fn validity(&self) -> Validity {
    Validity { from: self.valid_from, to: self.valid_to }
  }

  pub fn contains(&self, ts: DateTime<Utc>) -> bool { self.validity().contains(ts) }

  /// Look up an attribute in the tracked set first, then the untracked set.
  pub fn attribute(&self, name: &str) -> Option<&str> {
    self
      .tracked
      .get(name)
      .or_else(|| self.untracked.get(name))
      .map(String::as_str)
  }
}

/// Input to [`crate::store::DimensionStore::insert_version`].
///
/// The store assigns the surrogate key and timestamps; a new version is
/// always current with an open upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
  pub dimension:    Dimension,
  pub business_key: BusinessKey,
  pub tracked:      Attributes,
  pub untracked:    Attributes,
  pub valid_from:   DateTime<Utc>,
  pub metrics:      EntityMetrics,
}

/// Result of a point-in-time lookup against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionLookup {
  Found(DimensionVersion),
  /// The key exists but no version's interval contains the timestamp.
  OutOfRange,
  /// No version of the key exists at all.
  UnknownKey,
}

/// Pick the single version of `versions` whose interval contains `ts`.
///
/// `versions` must all belong to one business key. More than one match is an
/// [`Error::InvariantViolation`]; this is the shared selection rule for every
/// store backend that evaluates lookups in memory.
pub fn select_at(
  dimension: &Dimension,
  business_key: &BusinessKey,
  versions: &[DimensionVersion],
  ts: DateTime<Utc>,
) -> Result<VersionLookup> {
  if versions.is_empty() {
    return Ok(VersionLookup::UnknownKey);
  }

  let mut matches = versions.iter().filter(|v| v.contains(ts));
  match (matches.next(), matches.next()) {
    (None, _) => Ok(VersionLookup::OutOfRange),
    (Some(found), None) => Ok(VersionLookup::Found(found.clone())),
    (Some(a), Some(b)) => Err(Error::invariant(
      dimension,
      business_key,
      format!(
        "versions {} and {} both contain {}",
        a.surrogate_key,
        b.surrogate_key,
        ts.to_rfc3339()
      ),
    )),
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
  }

  #[test]
  fn open_sorts_after_any_instant() {
    let far = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
    assert!(ValidTo::Open > ValidTo::At(far));
    assert!(ValidTo::At(ts(1)) < ValidTo::At(ts(2)));
  }

  #[test]
  fn validity_is_half_open() {
    let v = Validity { from: ts(1), to: ValidTo::At(ts(5)) };
    assert!(v.contains(ts(1)));
    assert!(v.contains(ts(4)));
    assert!(!v.contains(ts(5)));
    assert!(!v.contains(Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap()));
  }

  #[test]
  fn empty_interval_contains_nothing_and_overlaps_nothing() {
    let empty = Validity { from: ts(3), to: ValidTo::At(ts(3)) };
    let wide = Validity { from: ts(1), to: ValidTo::Open };
    assert!(empty.is_empty());
    assert!(!empty.contains(ts(3)));
    assert!(!empty.overlaps(&wide));
  }

  #[test]
  fn adjacent_intervals_do_not_overlap() {
    let a = Validity { from: ts(1), to: ValidTo::At(ts(3)) };
    let b = Validity { from: ts(3), to: ValidTo::Open };
    let c = Validity { from: ts(2), to: ValidTo::Open };
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c));
    assert!(c.overlaps(&b));
  }

  #[test]
  fn store_precision_keeps_whole_microseconds() {
    let base = ts(1);
    let fine = base + chrono::Duration::nanoseconds(1_500);
    assert_eq!(to_store_precision(fine), base + chrono::Duration::microseconds(1));
    assert_eq!(to_store_precision(base), base);
  }

  #[test]
  fn business_key_rejects_blank() {
    assert!(matches!(BusinessKey::new("   "), Err(Error::MalformedInput(_))));
    assert_eq!(BusinessKey::new(" C-1 ").unwrap().as_str(), "C-1");
  }

  #[test]
  fn metrics_merge_adds_both_fields() {
    let a = EntityMetrics { event_count: 2, total_amount: Decimal::new(1050, 2) };
    let b = EntityMetrics { event_count: 1, total_amount: Decimal::new(25, 1) };
    let merged = a.checked_merge(&b).unwrap();
    assert_eq!(merged.event_count, 3);
    assert_eq!(merged.total_amount, Decimal::new(1300, 2));
  }
}
