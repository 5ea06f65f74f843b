//! Error types for the strata-quality engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("cannot read rule catalog {path}: {source}")]
  Read {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid rule catalog: {0}")]
  Toml(#[from] toml::de::Error),

  #[error("rule {name:?}: {reason}")]
  InvalidRule { name: String, reason: String },

  #[error(transparent)]
  Store(#[from] strata_core::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
