//! Persisted evaluations: rule results, their exceptions, and the scorecard
//! history.
//!
//! The trait follows the shape of the core store traits and is implemented by
//! storage backends. [`evaluate_and_record`] is the one-call path the CLI uses.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{
  dimension::to_store_precision,
  store::{DimensionStore, FactStore, StoreBackend},
};
use tracing::info;
use uuid::Uuid;

use crate::{
  Result,
  evaluate::{QualityReport, Scorecard, evaluate},
  rule::Catalog,
  view::{WarehouseView, store_error},
};

/// One evaluation of a catalog against the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
  pub evaluation_id: Uuid,
  pub evaluated_at:  DateTime<Utc>,
  pub report:        QualityReport,
}

impl Evaluation {
  pub fn new(report: QualityReport) -> Self {
    Self {
      evaluation_id: Uuid::new_v4(),
      evaluated_at: to_store_precision(Utc::now()),
      report,
    }
  }
}

/// A scorecard as it stood after one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorecardEntry {
  pub evaluation_id: Uuid,
  pub evaluated_at:  DateTime<Utc>,
  pub scorecard:     Scorecard,
}

pub trait QualityStore: StoreBackend {
  /// Store an evaluation with every result, exception and category score.
  fn record_evaluation<'a>(
    &'a self,
    evaluation: &'a Evaluation,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// A stored evaluation, results in catalog order.
  fn evaluation(
    &self,
    evaluation_id: Uuid,
  ) -> impl Future<Output = Result<Option<Evaluation>, Self::Error>> + Send + '_;

  /// The `limit` most recent scorecards, newest first.
  fn scorecard_history(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ScorecardEntry>, Self::Error>> + Send + '_;
}

/// Load a view of `store`, evaluate `catalog` against it and persist the
/// evaluation.
pub async fn evaluate_and_record<S>(store: &S, catalog: &Catalog) -> Result<Evaluation>
where
  S: DimensionStore + FactStore + QualityStore,
{
  let view = WarehouseView::load(store).await?;
  let evaluation = Evaluation::new(evaluate(catalog, &view));
  store.record_evaluation(&evaluation).await.map_err(store_error)?;
  info!(
    evaluation_id = %evaluation.evaluation_id,
    overall = evaluation.report.scorecard.overall,
    "quality evaluation recorded"
  );
  Ok(evaluation)
}
