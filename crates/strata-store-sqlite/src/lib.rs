//! SQLite backend for the Strata stores.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Besides the core store traits and
//! [`strata_quality::QualityStore`] it keeps the orphan log, the run log and
//! the cross-run lock.

mod derived;
mod encode;
mod quality;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{RunLock, SqliteStore};
