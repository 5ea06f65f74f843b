//! Event records and the fact records bound from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::dimension::{Dimension, SurrogateKey};

// ─── Input ───────────────────────────────────────────────────────────────────

/// A reference from an event to one dimension entity, by business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRef {
  pub dimension:    Dimension,
  /// Raw key as delivered; validated by the binder.
  pub business_key: String,
}

impl DimensionRef {
  pub fn new(dimension: Dimension, business_key: impl Into<String>) -> Self {
    Self { dimension, business_key: business_key.into() }
  }
}

/// Numeric measures of one event. Money is always [`Decimal`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measures {
  pub quantity:        i64,
  pub unit_price:      Decimal,
  /// Line total before discount.
  pub gross_amount:    Decimal,
  pub discount_amount: Decimal,
  pub tax_amount:      Decimal,
  pub shipping_amount: Decimal,
}

impl Measures {
  /// `gross_amount - discount_amount`, or `None` on decimal overflow.
  pub fn net_amount(&self) -> Option<Decimal> {
    self.gross_amount.checked_sub(self.discount_amount)
  }
}

/// One transactional event as delivered by the ingestion stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
  /// Natural identifier; facts are unique on it.
  pub event_id:    String,
  pub occurred_at: DateTime<Utc>,
  pub refs:        Vec<DimensionRef>,
  pub measures:    Measures,
}

// ─── Output ──────────────────────────────────────────────────────────────────

/// An event bound to the dimension versions valid when it occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
  pub event_id:    String,
  pub occurred_at: DateTime<Utc>,
  /// Calendar key (`YYYYMMDD`) of `occurred_at`.
  pub date_key:    u32,
  pub keys:        BTreeMap<Dimension, SurrogateKey>,
  pub measures:    Measures,
  pub net_amount:  Decimal,
  pub bound_at:    DateTime<Utc>,
}

/// Why a dimension reference could not be resolved.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnresolvedReason {
  /// No version of the business key exists.
  UnknownKey,
  /// The key exists but no version was valid at the event timestamp.
  OutOfRange,
}

/// One unresolved reference of one event. A required one rejects the fact;
/// an optional one leaves its dimension off the bound fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orphan {
  pub event_id:     String,
  pub dimension:    Dimension,
  pub business_key: String,
  pub occurred_at:  DateTime<Utc>,
  pub reason:       UnresolvedReason,
}

/// Calendar key for the derived date dimension, e.g. `20240315`.
pub fn date_key(ts: DateTime<Utc>) -> u32 {
  // Years are four-digit for any timestamp the store can represent.
  let year = u32::try_from(ts.year()).unwrap_or(0);
  year * 10_000 + ts.month() * 100 + ts.day()
}
