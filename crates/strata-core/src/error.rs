//! Error types for `strata-core`.
//!
//! The taxonomy mirrors how a run reacts to each failure:
//!
//! | Variant | Scope | Run reaction |
//! |---------|-------|--------------|
//! | [`Error::MalformedInput`] | one record | skipped, counted, run continues |
//! | [`Error::InvariantViolation`] | one business key | key abandoned, run `Incomplete` |
//! | [`Error::StoreUnavailable`] | whole run | retried, then run `Failed` |
//! | [`Error::Store`] | whole run | run `Failed` without retry |
//!
//! An unresolved dimension lookup is *not* an error; see
//! [`crate::resolver::Resolution`].

use thiserror::Error;

use crate::dimension::{BusinessKey, Dimension, SurrogateKey};

/// Boxed source error from a storage backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("malformed input: {0}")]
  MalformedInput(String),

  #[error("invariant violation on {dimension}/{business_key}: {detail}")]
  InvariantViolation {
    dimension:    Dimension,
    business_key: BusinessKey,
    detail:       String,
  },

  #[error("store unavailable: {0}")]
  StoreUnavailable(#[source] BoxError),

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("version not found: {0}")]
  VersionNotFound(SurrogateKey),

  #[error("version {0} is closed; only current versions accept metrics")]
  NotCurrent(SurrogateKey),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn invariant(
    dimension: &Dimension,
    business_key: &BusinessKey,
    detail: impl Into<String>,
  ) -> Self {
    Self::InvariantViolation {
      dimension:    dimension.clone(),
      business_key: business_key.clone(),
      detail:       detail.into(),
    }
  }

  /// Whether retrying the same call may succeed.
  pub fn is_transient(&self) -> bool { matches!(self, Self::StoreUnavailable(_)) }

  /// Whether the error is confined to a single input record.
  pub fn is_per_record(&self) -> bool { matches!(self, Self::MalformedInput(_)) }

  /// Whether the error is confined to a single business key.
  pub fn is_per_entity(&self) -> bool {
    matches!(
      self,
      Self::InvariantViolation { .. } | Self::VersionNotFound(_) | Self::NotCurrent(_)
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
