//! Error type for `strata-store-sqlite`.

use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// A domain error detected by the store, e.g. a second current version.
  #[error(transparent)]
  Core(#[from] strata_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("decimal parse error: {0}")]
  Decimal(#[from] rust_decimal::Error),

  #[error("unrecognised {what}: {value:?}")]
  Label { what: &'static str, value: String },

  #[error("run {held_by} has held the run lock since {since}")]
  RunLocked { held_by: Uuid, since: DateTime<Utc> },

  #[error("run {0} does not hold the run lock")]
  NotLockHolder(Uuid),
}

impl Error {
  /// Whether the database was busy or gone, so a retry may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Database(tokio_rusqlite::Error::ConnectionClosed) => true,
      Self::Database(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))) => {
        matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
      }
      _ => false,
    }
  }
}

impl From<Error> for strata_core::Error {
  fn from(e: Error) -> Self {
    match e {
      Error::Core(inner) => inner,
      e if e.is_transient() => Self::StoreUnavailable(Box::new(e)),
      e => Self::Store(Box::new(e)),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
