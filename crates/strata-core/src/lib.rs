//! Core types, store traits and the temporal dimension engine for Strata.
//!
//! This crate is deliberately free of database, file-format and CLI
//! dependencies. Storage backends implement the traits in [`store`]; the
//! engine ([`writer`], [`resolver`], [`binder`], [`response`], [`rollup`],
//! [`aggregate`], [`run`]) is written against those traits only.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod aggregate;
pub mod binder;
pub mod dimension;
pub mod error;
pub mod event;
pub mod history;
pub mod memory;
pub mod resolver;
pub mod response;
pub mod retry;
pub mod rollup;
pub mod run;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use error::{Error, Result};
