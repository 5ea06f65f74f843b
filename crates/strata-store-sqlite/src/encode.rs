//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are fixed-width UTC text with microsecond precision; calendar
//! dates are `YYYY-MM-DD`. Attribute maps are compact JSON. Decimals are their
//! canonical string form. UUIDs are hyphenated lowercase strings. Enums are
//! their snake_case labels.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use strata_core::{
  dimension::{
    Attributes, BusinessKey, Dimension, DimensionVersion, EntityMetrics, SurrogateKey, ValidTo,
  },
  event::{FactRecord, Measures, Orphan, UnresolvedReason},
};
use uuid::Uuid;

use crate::{Error, Result};

/// Stored `valid_to` of every current version.
pub const OPEN_SENTINEL: &str = "9999-12-31T23:59:59.999999Z";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const DATE_FORMAT: &str = "%Y-%m-%d";

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.format(TIMESTAMP_FORMAT).to_string() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn encode_date(date: NaiveDate) -> String { date.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn encode_valid_to(to: ValidTo) -> String {
  match to {
    ValidTo::At(dt) => encode_dt(dt),
    ValidTo::Open => OPEN_SENTINEL.to_owned(),
  }
}

pub fn decode_valid_to(s: &str) -> Result<ValidTo> {
  if s == OPEN_SENTINEL {
    return Ok(ValidTo::Open);
  }
  decode_dt(s).map(ValidTo::At)
}

// ─── Attributes & decimals ───────────────────────────────────────────────────

pub fn encode_attrs(attrs: &Attributes) -> Result<String> { Ok(serde_json::to_string(attrs)?) }

pub fn decode_attrs(s: &str) -> Result<Attributes> { Ok(serde_json::from_str(s)?) }

pub fn encode_decimal(d: Decimal) -> String { d.to_string() }

pub fn decode_decimal(s: &str) -> Result<Decimal> { Ok(Decimal::from_str(s)?) }

pub fn decode_opt_decimal(s: Option<&str>) -> Result<Option<Decimal>> {
  s.map(decode_decimal).transpose()
}

/// Parse a stored enum label; `what` names the column in the error.
pub fn decode_label<T: FromStr>(s: &str, what: &'static str) -> Result<T> {
  T::from_str(s).map_err(|_| Error::Label { what, value: s.to_owned() })
}

pub fn decode_reason(s: &str) -> Result<UnresolvedReason> { decode_label(s, "orphan reason") }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawVersion::from_row`].
pub const VERSION_COLUMNS: &str = "surrogate_key, dimension, business_key, tracked_json, \
   untracked_json, valid_from, valid_to, is_current, event_count, total_amount, recorded_at, \
   updated_at";

/// Raw values read directly from a `dimension_versions` row.
pub struct RawVersion {
  pub surrogate_key:  i64,
  pub dimension:      String,
  pub business_key:   String,
  pub tracked_json:   String,
  pub untracked_json: String,
  pub valid_from:     String,
  pub valid_to:       String,
  pub is_current:     bool,
  pub event_count:    i64,
  pub total_amount:   String,
  pub recorded_at:    String,
  pub updated_at:     String,
}

impl RawVersion {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      surrogate_key:  row.get(0)?,
      dimension:      row.get(1)?,
      business_key:   row.get(2)?,
      tracked_json:   row.get(3)?,
      untracked_json: row.get(4)?,
      valid_from:     row.get(5)?,
      valid_to:       row.get(6)?,
      is_current:     row.get(7)?,
      event_count:    row.get(8)?,
      total_amount:   row.get(9)?,
      recorded_at:    row.get(10)?,
      updated_at:     row.get(11)?,
    })
  }

  pub fn into_version(self) -> Result<DimensionVersion> {
    Ok(DimensionVersion {
      surrogate_key: SurrogateKey(self.surrogate_key),
      dimension:     Dimension::new(self.dimension),
      business_key:  BusinessKey::new(self.business_key)?,
      tracked:       decode_attrs(&self.tracked_json)?,
      untracked:     decode_attrs(&self.untracked_json)?,
      valid_from:    decode_dt(&self.valid_from)?,
      valid_to:      decode_valid_to(&self.valid_to)?,
      is_current:    self.is_current,
      metrics:       EntityMetrics {
        event_count:  u64::try_from(self.event_count).unwrap_or_default(),
        total_amount: decode_decimal(&self.total_amount)?,
      },
      recorded_at:   decode_dt(&self.recorded_at)?,
      updated_at:    decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values read from a `facts` row.
pub struct RawFact {
  pub event_id:        String,
  pub occurred_at:     String,
  pub date_key:        u32,
  pub quantity:        i64,
  pub unit_price:      String,
  pub gross_amount:    String,
  pub discount_amount: String,
  pub tax_amount:      String,
  pub shipping_amount: String,
  pub net_amount:      String,
  pub bound_at:        String,
}

impl RawFact {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:        row.get(0)?,
      occurred_at:     row.get(1)?,
      date_key:        row.get(2)?,
      quantity:        row.get(3)?,
      unit_price:      row.get(4)?,
      gross_amount:    row.get(5)?,
      discount_amount: row.get(6)?,
      tax_amount:      row.get(7)?,
      shipping_amount: row.get(8)?,
      net_amount:      row.get(9)?,
      bound_at:        row.get(10)?,
    })
  }

  pub fn into_fact(self, keys: BTreeMap<Dimension, SurrogateKey>) -> Result<FactRecord> {
    Ok(FactRecord {
      event_id: self.event_id,
      occurred_at: decode_dt(&self.occurred_at)?,
      date_key: self.date_key,
      keys,
      measures: Measures {
        quantity:        self.quantity,
        unit_price:      decode_decimal(&self.unit_price)?,
        gross_amount:    decode_decimal(&self.gross_amount)?,
        discount_amount: decode_decimal(&self.discount_amount)?,
        tax_amount:      decode_decimal(&self.tax_amount)?,
        shipping_amount: decode_decimal(&self.shipping_amount)?,
      },
      net_amount: decode_decimal(&self.net_amount)?,
      bound_at: decode_dt(&self.bound_at)?,
    })
  }
}

/// Raw values read from an `orphans` row.
pub struct RawOrphan {
  pub run_id:       String,
  pub event_id:     String,
  pub dimension:    String,
  pub business_key: String,
  pub occurred_at:  String,
  pub reason:       String,
}

impl RawOrphan {
  pub fn into_orphan(self) -> Result<(Uuid, Orphan)> {
    let orphan = Orphan {
      event_id:     self.event_id,
      dimension:    Dimension::new(self.dimension),
      business_key: self.business_key,
      occurred_at:  decode_dt(&self.occurred_at)?,
      reason:       decode_reason(&self.reason)?,
    };
    Ok((decode_uuid(&self.run_id)?, orphan))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_are_fixed_width_and_sort_lexically() {
    let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let late = early + chrono::Duration::microseconds(1);
    let (a, b) = (encode_dt(early), encode_dt(late));
    assert_eq!(a, "2024-01-02T03:04:05.000000Z");
    assert_eq!(a.len(), OPEN_SENTINEL.len());
    assert!(a < b);
    assert!(b.as_str() < OPEN_SENTINEL);
    assert_eq!(decode_dt(&b).unwrap(), late);
  }

  #[test]
  fn open_bound_uses_sentinel() {
    assert_eq!(encode_valid_to(ValidTo::Open), OPEN_SENTINEL);
    assert_eq!(decode_valid_to(OPEN_SENTINEL).unwrap(), ValidTo::Open);
  }

  #[test]
  fn closed_bound_encodes_like_any_timestamp() {
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    assert_eq!(encode_valid_to(ValidTo::At(at)), encode_dt(at));
    assert_eq!(decode_valid_to(&encode_dt(at)).unwrap(), ValidTo::At(at));
  }

  #[test]
  fn unknown_labels_are_rejected_by_column() {
    assert_eq!(decode_reason("out_of_range").unwrap(), UnresolvedReason::OutOfRange);
    let err = decode_reason("lost").unwrap_err();
    assert!(matches!(err, Error::Label { what: "orphan reason", .. }), "{err}");
    assert_eq!(decode_date("2024-02-29").unwrap(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
  }
}
