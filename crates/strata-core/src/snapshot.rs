//! Attribute snapshots, the input of the version writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::{Attributes, Dimension};

/// One observed state of an entity, as delivered by the ingestion stage.
///
/// The business key is kept raw so that a snapshot with a missing key can be
/// rejected per record by the writer instead of failing the whole feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub dimension:     Dimension,
  pub business_key:  String,
  #[serde(default)]
  pub tracked:       Attributes,
  #[serde(default)]
  pub untracked:     Attributes,
  /// When the entity came into existence (e.g. registration). Required the
  /// first time a key is seen; becomes the first version's `valid_from`.
  pub originated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
  pub fn new(dimension: Dimension, business_key: impl Into<String>) -> Self {
    Self {
      dimension,
      business_key: business_key.into(),
      tracked: Attributes::new(),
      untracked: Attributes::new(),
      originated_at: None,
    }
  }

  pub fn tracked(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.tracked.insert(name.into(), value.into());
    self
  }

  pub fn untracked(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.untracked.insert(name.into(), value.into());
    self
  }

  pub fn originated_at(mut self, at: DateTime<Utc>) -> Self {
    self.originated_at = Some(at);
    self
  }
}
