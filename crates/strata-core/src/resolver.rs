//! Point-in-time resolution of business keys to surrogate keys.
//!
//! The resolver only reads from the store. An unknown key, or a known key
//! with no version valid at the requested instant, is a normal
//! [`Resolution::Unresolved`] outcome. Two matching versions mean the store is
//! corrupt and surface as [`crate::Error::InvariantViolation`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Result,
  dimension::{BusinessKey, Dimension, SurrogateKey, VersionLookup},
  event::UnresolvedReason,
  retry::{RetryConfig, retrying},
  store::DimensionStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum Resolution {
  Resolved(SurrogateKey),
  Unresolved(UnresolvedReason),
}

impl Resolution {
  pub fn surrogate_key(&self) -> Option<SurrogateKey> {
    match self {
      Self::Resolved(sk) => Some(*sk),
      Self::Unresolved(_) => None,
    }
  }
}

impl From<VersionLookup> for Resolution {
  fn from(lookup: VersionLookup) -> Self {
    match lookup {
      VersionLookup::Found(v) => Self::Resolved(v.surrogate_key),
      VersionLookup::OutOfRange => Self::Unresolved(UnresolvedReason::OutOfRange),
      VersionLookup::UnknownKey => Self::Unresolved(UnresolvedReason::UnknownKey),
    }
  }
}

pub struct Resolver<'s, S> {
  store: &'s S,
  retry: RetryConfig,
}

impl<'s, S: DimensionStore> Resolver<'s, S> {
  pub fn new(store: &'s S, retry: RetryConfig) -> Self { Self { store, retry } }

  /// The surrogate key of the version of `key` valid at `at`.
  pub async fn resolve(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
    at: DateTime<Utc>,
  ) -> Result<Resolution> {
    let store = self.store;
    let lookup =
      retrying(&self.retry, "version_at", || store.version_at(dimension, key, at)).await?;
    Ok(lookup.into())
  }

  /// The surrogate key of the current version of `key`, for lookups that
  /// carry no timestamp.
  pub async fn resolve_current(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
  ) -> Result<Resolution> {
    let store = self.store;
    let current =
      retrying(&self.retry, "current_version", || store.current_version(dimension, key)).await?;
    Ok(match current {
      Some(version) => Resolution::Resolved(version.surrogate_key),
      None => Resolution::Unresolved(UnresolvedReason::UnknownKey),
    })
  }
}
