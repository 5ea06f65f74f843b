use std::{collections::HashMap, fs::File, io, path::Path, str::FromStr};

use chrono::{DateTime, Utc};
use csv::StringRecord;
use rust_decimal::Decimal;
use strata_core::{
  dimension::{Attributes, Dimension},
  event::{DimensionRef, EventRecord, Measures},
  response::{ResponseKind, ResponseRecord},
  snapshot::Snapshot,
};
use tracing::{info, warn};

use crate::{
  Error, Result,
  error::{RowError, RowFault},
  profile::{EventProfile, FeedProfile, ResponseProfile, TimestampFormat},
};

/// One entry per data row, in file order.
pub type Rows<T> = Vec<Result<T, RowError>>;

// ─── Header & rows ───────────────────────────────────────────────────────────

struct Header(HashMap<String, usize>);

impl Header {
  fn new(record: &StringRecord) -> Self {
    Self(record.iter().enumerate().map(|(i, name)| (name.trim().to_owned(), i)).collect())
  }

  fn require(&self, column: &str) -> Result<usize> {
    self.0.get(column).copied().ok_or_else(|| Error::MissingColumn(column.to_owned()))
  }

  fn optional(&self, column: &str) -> Option<usize> { self.0.get(column).copied() }

  fn named(&self, columns: &[String]) -> Result<Vec<(String, usize)>> {
    columns.iter().map(|c| Ok((c.clone(), self.require(c)?))).collect()
  }
}

/// Empty cells read as absent.
struct Row<'r>(&'r StringRecord);

impl Row<'_> {
  fn cell(&self, index: usize) -> Option<&str> {
    self.0.get(index).map(str::trim).filter(|s| !s.is_empty())
  }

  fn required(&self, index: usize, column: &str) -> Result<&str, RowFault> {
    self.cell(index).ok_or_else(|| RowFault::MissingValue { column: column.to_owned() })
  }

  fn timestamp(
    &self,
    index: usize,
    column: &str,
    format: TimestampFormat,
  ) -> Result<Option<DateTime<Utc>>, RowFault> {
    let Some(raw) = self.cell(index) else { return Ok(None) };
    format.parse(raw).map(Some).ok_or_else(|| RowFault::InvalidTimestamp {
      column: column.to_owned(),
      value:  raw.to_owned(),
    })
  }

  fn decimal(&self, index: Option<usize>, column: &str) -> Result<Decimal, RowFault> {
    let Some(raw) = index.and_then(|i| self.cell(i)) else { return Ok(Decimal::ZERO) };
    Decimal::from_str(raw).map_err(|_| RowFault::InvalidDecimal {
      column: column.to_owned(),
      value:  raw.to_owned(),
    })
  }

  fn attributes(&self, columns: &[(String, usize)]) -> Attributes {
    columns
      .iter()
      .filter_map(|(name, i)| self.cell(*i).map(|v| (name.clone(), v.to_owned())))
      .collect()
  }
}

/// Resolve the profile's columns against the header once, then parse every
/// data row. A profile naming an absent column fails the whole feed; only I/O
/// failures abort once rows are being read.
fn read_rows<R, P, T>(
  reader: R,
  plan: impl FnOnce(&Header) -> Result<P>,
  parse: impl Fn(&P, &Row<'_>) -> Result<T, RowFault>,
) -> Result<Rows<T>>
where
  R: io::Read,
{
  let mut csv = csv::ReaderBuilder::new().from_reader(reader);
  let plan = plan(&Header::new(csv.headers()?))?;

  let mut rows = Vec::new();
  for (index, record) in csv.records().enumerate() {
    let fallback = index as u64 + 2;
    let outcome = match record {
      Ok(record) => {
        let row = record.position().map_or(fallback, |p| p.line());
        parse(&plan, &Row(&record)).map_err(|fault| RowError { row, fault })
      }
      Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => return Err(e.into()),
      Err(e) => {
        let row = e.position().map_or(fallback, |p| p.line());
        Err(RowError { row, fault: e.into() })
      }
    };
    if let Err(e) = &outcome {
      warn!(row = e.row, error = %e.fault, "skipping malformed feed row");
    }
    rows.push(outcome);
  }
  Ok(rows)
}

fn open(path: &Path) -> Result<File> {
  File::open(path).map_err(|source| Error::Open { path: path.to_owned(), source })
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

struct SnapshotColumns {
  business_key:  usize,
  originated_at: Option<usize>,
  tracked:       Vec<(String, usize)>,
  untracked:     Vec<(String, usize)>,
}

/// Read a snapshot feed for `dimension` from any reader.
pub fn read_snapshots<R: io::Read>(
  reader: R,
  dimension: &Dimension,
  profile: &FeedProfile,
) -> Result<Rows<Snapshot>> {
  read_rows(
    reader,
    |header| {
      Ok(SnapshotColumns {
        business_key:  header.require(&profile.business_key)?,
        originated_at: profile.originated_at.as_deref().map(|c| header.require(c)).transpose()?,
        tracked:       header.named(&profile.tracked)?,
        untracked:     header.named(&profile.untracked)?,
      })
    },
    |cols, row| {
      let key = row.required(cols.business_key, &profile.business_key)?;
      let originated_at = match (cols.originated_at, profile.originated_at.as_deref()) {
        (Some(i), Some(column)) => row.timestamp(i, column, profile.timestamp_format)?,
        _ => None,
      };
      Ok(Snapshot {
        dimension: dimension.clone(),
        business_key: key.to_owned(),
        tracked: row.attributes(&cols.tracked),
        untracked: row.attributes(&cols.untracked),
        originated_at,
      })
    },
  )
}

/// Read the snapshot feed at `profile.path`.
pub fn load_snapshots(dimension: &Dimension, profile: &FeedProfile) -> Result<Rows<Snapshot>> {
  let rows = read_snapshots(open(&profile.path)?, dimension, profile)?;
  let rejected = rows.iter().filter(|r| r.is_err()).count();
  info!(
    %dimension,
    path = %profile.path.display(),
    rows = rows.len(),
    rejected,
    "snapshot feed read"
  );
  Ok(rows)
}

// ─── Events ──────────────────────────────────────────────────────────────────

struct EventColumns {
  event_id:        usize,
  occurred_at:     usize,
  dimensions:      Vec<(Dimension, usize)>,
  quantity:        usize,
  unit_price:      Option<usize>,
  line_total:      usize,
  discount_amount: Option<usize>,
  tax_amount:      Option<usize>,
  shipping_amount: Option<usize>,
}

/// Read an event feed from any reader.
pub fn read_events<R: io::Read>(reader: R, profile: &EventProfile) -> Result<Rows<EventRecord>> {
  let m = &profile.measures;
  read_rows(
    reader,
    |header| {
      let dimensions: Vec<(Dimension, usize)> = profile
        .dimensions
        .iter()
        .map(|(dim, column)| Ok((dim.clone(), header.require(column)?)))
        .collect::<Result<_>>()?;
      Ok(EventColumns {
        event_id: header.require(&profile.event_id)?,
        occurred_at: header.require(&profile.occurred_at)?,
        dimensions,
        quantity: header.require(&m.quantity)?,
        unit_price: header.optional(&m.unit_price),
        line_total: header.require(&m.line_total)?,
        discount_amount: header.optional(&m.discount_amount),
        tax_amount: header.optional(&m.tax_amount),
        shipping_amount: header.optional(&m.shipping_amount),
      })
    },
    |cols, row| {
      let event_id = row.required(cols.event_id, &profile.event_id)?;
      let occurred_at = row
        .timestamp(cols.occurred_at, &profile.occurred_at, profile.timestamp_format)?
        .ok_or_else(|| RowFault::MissingValue { column: profile.occurred_at.clone() })?;

      let raw_quantity = row.required(cols.quantity, &m.quantity)?;
      let quantity = raw_quantity.parse::<i64>().map_err(|_| RowFault::InvalidQuantity {
        column: m.quantity.clone(),
        value:  raw_quantity.to_owned(),
      })?;
      row.required(cols.line_total, &m.line_total)?;
      let gross_amount = row.decimal(Some(cols.line_total), &m.line_total)?;

      // A blank cell stays a reference with an empty key; the binder decides
      // whether that dimension may be left off the fact.
      let refs = cols
        .dimensions
        .iter()
        .map(|(dim, i)| DimensionRef::new(dim.clone(), row.cell(*i).unwrap_or_default()))
        .collect();

      Ok(EventRecord {
        event_id: event_id.to_owned(),
        occurred_at,
        refs,
        measures: Measures {
          quantity,
          unit_price: row.decimal(cols.unit_price, &m.unit_price)?,
          gross_amount,
          discount_amount: row.decimal(cols.discount_amount, &m.discount_amount)?,
          tax_amount: row.decimal(cols.tax_amount, &m.tax_amount)?,
          shipping_amount: row.decimal(cols.shipping_amount, &m.shipping_amount)?,
        },
      })
    },
  )
}

/// Read the event feed at `profile.path`.
pub fn load_events(profile: &EventProfile) -> Result<Rows<EventRecord>> {
  let rows = read_events(open(&profile.path)?, profile)?;
  let rejected = rows.iter().filter(|r| r.is_err()).count();
  info!(path = %profile.path.display(), rows = rows.len(), rejected, "event feed read");
  Ok(rows)
}

// ─── Responses ───────────────────────────────────────────────────────────────

struct ResponseColumns {
  response_id:      usize,
  responded_at:     usize,
  customer_id:      usize,
  campaign_id:      usize,
  response_type:    usize,
  conversion_value: Option<usize>,
}

/// Read a campaign response feed from any reader. Blank customer or campaign
/// cells are passed through for the binder to reject.
pub fn read_responses<R: io::Read>(
  reader: R,
  profile: &ResponseProfile,
) -> Result<Rows<ResponseRecord>> {
  let value_column = profile.conversion_value.as_deref().unwrap_or_default();
  read_rows(
    reader,
    |header| {
      Ok(ResponseColumns {
        response_id:      header.require(&profile.response_id)?,
        responded_at:     header.require(&profile.responded_at)?,
        customer_id:      header.require(&profile.customer_id)?,
        campaign_id:      header.require(&profile.campaign_id)?,
        response_type:    header.require(&profile.response_type)?,
        conversion_value: profile.conversion_value.as_deref().and_then(|c| header.optional(c)),
      })
    },
    |cols, row| {
      let response_id = row.required(cols.response_id, &profile.response_id)?;
      let responded_at = row
        .timestamp(cols.responded_at, &profile.responded_at, profile.timestamp_format)?
        .ok_or_else(|| RowFault::MissingValue { column: profile.responded_at.clone() })?;
      let raw_kind = row.required(cols.response_type, &profile.response_type)?;
      let kind = ResponseKind::from_str(raw_kind).map_err(|_| RowFault::InvalidChoice {
        column: profile.response_type.clone(),
        value:  raw_kind.to_owned(),
      })?;

      Ok(ResponseRecord {
        response_id: response_id.to_owned(),
        responded_at,
        customer_key: row.cell(cols.customer_id).unwrap_or_default().to_owned(),
        campaign_key: row.cell(cols.campaign_id).unwrap_or_default().to_owned(),
        kind,
        conversion_value: row.decimal(cols.conversion_value, value_column)?,
      })
    },
  )
}

/// Read the response feed at `profile.path`.
pub fn load_responses(profile: &ResponseProfile) -> Result<Rows<ResponseRecord>> {
  let rows = read_responses(open(&profile.path)?, profile)?;
  let rejected = rows.iter().filter(|r| r.is_err()).count();
  info!(path = %profile.path.display(), rows = rows.len(), rejected, "response feed read");
  Ok(rows)
}
