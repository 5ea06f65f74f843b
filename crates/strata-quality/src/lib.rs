//! Rule-based data-quality checks over a Strata warehouse.
//!
//! Rules come from a TOML [`Catalog`] and are evaluated against a
//! [`WarehouseView`] loaded from any store. Each rule yields a
//! [`RuleResult`]; results roll up into a per-category [`Scorecard`].
//! Backends implementing [`QualityStore`] keep every evaluation, so the
//! scorecard can be followed over time.
//!
//! ```no_run
//! use strata_core::memory::MemoryStore;
//! use strata_quality::{Catalog, WarehouseView, evaluate};
//!
//! # async fn demo(store: &MemoryStore) -> strata_quality::Result<()> {
//! let catalog = Catalog::load("quality.toml".as_ref())?;
//! let view = WarehouseView::load(store).await?;
//! let report = evaluate(&catalog, &view);
//! println!("overall {:.2}", report.scorecard.overall);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod evaluate;
pub mod rule;
pub mod store;
pub mod view;

pub use error::{Error, Result};
pub use evaluate::{
  Exception, QualityReport, RuleResult, RuleStatus, Scorecard, evaluate, evaluate_rule, scorecard,
};
pub use rule::{Catalog, Category, Comparison, Measure, Rule, RuleKind, Scalar, Severity, Target};
pub use store::{Evaluation, QualityStore, ScorecardEntry, evaluate_and_record};
pub use view::WarehouseView;
