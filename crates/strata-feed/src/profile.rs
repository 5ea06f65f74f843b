//! Column mappings for the input feeds.
//!
//! Profiles are plain serde values so they can live in the `[feeds.*]`,
//! `[events]` and `[responses]` sections of the configuration file.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::dimension::Dimension;

// ─── Timestamps ──────────────────────────────────────────────────────────────

/// How timestamp cells are written in a feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
  /// RFC 3339 (`2024-03-15T10:30:00Z`, offsets allowed).
  Rfc3339,
  /// `YYYY-MM-DD`, meaning midnight UTC.
  Date,
  /// RFC 3339, then `YYYY-MM-DD HH:MM:SS` (UTC), then `YYYY-MM-DD`.
  #[default]
  Auto,
}

impl TimestampFormat {
  pub fn parse(self, raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    match self {
      Self::Rfc3339 => parse_rfc3339(raw),
      Self::Date => parse_date(raw),
      Self::Auto => parse_rfc3339(raw)
        .or_else(|| {
          NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|dt| dt.and_utc())
        })
        .or_else(|| parse_date(raw)),
    }
  }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
  NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
}

// ─── Snapshot feed ───────────────────────────────────────────────────────────

/// Maps the columns of one dimension's snapshot feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedProfile {
  /// CSV file holding the feed.
  pub path:             PathBuf,
  pub business_key:     String,
  /// Column holding the entity's origination timestamp, if the feed has one.
  #[serde(default)]
  pub originated_at:    Option<String>,
  /// Attributes whose change opens a new version.
  #[serde(default)]
  pub tracked:          Vec<String>,
  /// Attributes overwritten in place on the current version.
  #[serde(default)]
  pub untracked:        Vec<String>,
  #[serde(default)]
  pub timestamp_format: TimestampFormat,
}

// ─── Event feed ──────────────────────────────────────────────────────────────

/// Measure column names. `quantity` and `line_total` must be present in the
/// header; the others read as zero when absent or empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureColumns {
  pub quantity:        String,
  pub unit_price:      String,
  pub line_total:      String,
  pub discount_amount: String,
  pub tax_amount:      String,
  pub shipping_amount: String,
}

impl Default for MeasureColumns {
  fn default() -> Self {
    Self {
      quantity:        "quantity".into(),
      unit_price:      "unit_price".into(),
      line_total:      "line_total".into(),
      discount_amount: "discount_amount".into(),
      tax_amount:      "tax_amount".into(),
      shipping_amount: "shipping_amount".into(),
    }
  }
}

/// Maps the columns of the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProfile {
  pub path:             PathBuf,
  pub event_id:         String,
  pub occurred_at:      String,
  /// Dimension → the column holding its business keys. An empty cell means
  /// the event does not reference that dimension.
  pub dimensions:       BTreeMap<Dimension, String>,
  #[serde(default)]
  pub measures:         MeasureColumns,
  #[serde(default)]
  pub timestamp_format: TimestampFormat,
}

// ─── Response feed ───────────────────────────────────────────────────────────

/// Maps the columns of the campaign response feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseProfile {
  pub path:             PathBuf,
  pub response_id:      String,
  pub responded_at:     String,
  pub customer_id:      String,
  pub campaign_id:      String,
  /// Holds `opened`, `clicked` or `converted`, in any case.
  pub response_type:    String,
  /// Reads as zero when unset, absent from the header, or empty.
  #[serde(default)]
  pub conversion_value: Option<String>,
  #[serde(default)]
  pub timestamp_format: TimestampFormat,
}
