//! `strata.toml` loading.
//!
//! Values come from the TOML file (optional) and are overridden by
//! `STRATA_`-prefixed environment variables, with `__` separating nested
//! keys: `STRATA_STORE_PATH`, `STRATA_RETRY__MAX_ATTEMPTS`.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use strata_core::{dimension::Dimension, retry::RetryConfig, run::PipelineConfig};
use strata_feed::{EventProfile, FeedProfile, ResponseProfile};

#[derive(Debug, Clone, Deserialize)]
pub struct StrataConfig {
  #[serde(default = "default_store_path")]
  pub store_path:    PathBuf,
  #[serde(default)]
  pub pipeline:      PipelineConfig,
  #[serde(default)]
  pub retry:         RetryConfig,
  /// One snapshot feed per dimension, written to the store in key order.
  #[serde(default)]
  pub feeds:         BTreeMap<Dimension, FeedProfile>,
  #[serde(default)]
  pub events:        Option<EventProfile>,
  /// Campaign response feed, bound after the events.
  #[serde(default)]
  pub responses:     Option<ResponseProfile>,
  /// Rule catalog used by `strata quality` when `--rules` is not given.
  #[serde(default)]
  pub quality_rules: Option<PathBuf>,
}

fn default_store_path() -> PathBuf { PathBuf::from("strata.db") }

impl StrataConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = ::config::Config::builder()
      .add_source(::config::File::from(path).required(false))
      .add_source(
        ::config::Environment::with_prefix("STRATA")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut config: Self =
      settings.try_deserialize().context("failed to deserialise StrataConfig")?;
    config.store_path = expand_tilde(&config.store_path);
    Ok(config)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
