//! Error types for the strata-feed codec.

use std::path::PathBuf;

use thiserror::Error;

/// A failure that makes the whole feed unreadable.
#[derive(Debug, Error)]
pub enum Error {
  #[error("cannot open feed {path}: {source}")]
  Open {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("feed header has no column {0:?}")]
  MissingColumn(String),

  #[error("CSV error: {0}")]
  Csv(#[from] csv::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure confined to one data row. The row is skipped; the rest of the
/// feed is still read.
#[derive(Debug, Error)]
#[error("row {row}: {fault}")]
pub struct RowError {
  /// 1-based line number in the file (the header is line 1).
  pub row:   u64,
  pub fault: RowFault,
}

#[derive(Debug, Error)]
pub enum RowFault {
  #[error("unreadable record: {0}")]
  Csv(#[from] csv::Error),

  #[error("column {column:?} is empty")]
  MissingValue { column: String },

  #[error("column {column:?}: invalid timestamp {value:?}")]
  InvalidTimestamp { column: String, value: String },

  #[error("column {column:?}: invalid decimal {value:?}")]
  InvalidDecimal { column: String, value: String },

  #[error("column {column:?}: invalid quantity {value:?}")]
  InvalidQuantity { column: String, value: String },

  #[error("column {column:?}: unrecognised value {value:?}")]
  InvalidChoice { column: String, value: String },
}
