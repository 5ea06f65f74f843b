use std::collections::{BTreeMap, HashSet};

use strata_core::{
  dimension::{Dimension, DimensionVersion, SurrogateKey},
  event::FactRecord,
  store::{DimensionStore, FactStore},
};

use crate::{Error, Result};

/// A read-only copy of the warehouse that rules are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct WarehouseView {
  /// Per dimension, ordered by business key then `valid_from`.
  pub versions: BTreeMap<Dimension, Vec<DimensionVersion>>,
  pub facts:    Vec<FactRecord>,
}

impl WarehouseView {
  pub async fn load<S>(store: &S) -> Result<Self>
  where
    S: DimensionStore + FactStore,
  {
    let mut versions = BTreeMap::new();
    for dimension in store.dimensions().await.map_err(store_error)? {
      let rows = store.versions(&dimension).await.map_err(store_error)?;
      versions.insert(dimension, rows);
    }
    let facts = store.facts().await.map_err(store_error)?;
    Ok(Self { versions, facts })
  }

  pub fn versions(&self, dimension: &Dimension) -> &[DimensionVersion] {
    self.versions.get(dimension).map_or(&[], Vec::as_slice)
  }

  pub fn current(&self, dimension: &Dimension) -> impl Iterator<Item = &DimensionVersion> {
    self.versions(dimension).iter().filter(|v| v.is_current)
  }

  pub fn surrogate_keys(&self, dimension: &Dimension) -> HashSet<SurrogateKey> {
    self.versions(dimension).iter().map(|v| v.surrogate_key).collect()
  }
}

pub(crate) fn store_error(e: impl Into<strata_core::Error>) -> Error { Error::Store(e.into()) }
