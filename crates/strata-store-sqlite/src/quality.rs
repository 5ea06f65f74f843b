//! [`QualityStore`] for [`SqliteStore`]: every evaluation is kept with its
//! rule results, their exceptions and the category scores.

use std::collections::{BTreeMap, HashMap};

use rusqlite::{OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use strata_quality::{
  Category, Evaluation, Exception, QualityReport, QualityStore, RuleResult, Scorecard,
  ScorecardEntry,
};

use crate::{
  Result, SqliteStore,
  encode::{decode_dt, decode_label, decode_uuid, encode_dt, encode_uuid},
};

fn to_i64<T: TryInto<i64>>(n: T) -> i64 { n.try_into().unwrap_or(i64::MAX) }

fn to_u64(n: i64) -> u64 { u64::try_from(n).unwrap_or_default() }

fn to_usize(n: i64) -> usize { usize::try_from(n).unwrap_or_default() }

// ─── Raw rows ────────────────────────────────────────────────────────────────

/// A `quality_evaluations` row.
struct RawEvaluation {
  evaluation_id:  String,
  evaluated_at:   String,
  overall:        f64,
  total_records:  i64,
  failed_records: i64,
  passed:         i64,
  warning:        i64,
  failed:         i64,
}

const EVALUATION_COLUMNS: &str = "evaluation_id, evaluated_at, overall, total_records, \
   failed_records, passed, warning, failed";

impl RawEvaluation {
  fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      evaluation_id:  r.get(0)?,
      evaluated_at:   r.get(1)?,
      overall:        r.get(2)?,
      total_records:  r.get(3)?,
      failed_records: r.get(4)?,
      passed:         r.get(5)?,
      warning:        r.get(6)?,
      failed:         r.get(7)?,
    })
  }

  fn into_entry(self, scores: Vec<(String, f64)>) -> Result<ScorecardEntry> {
    let categories = scores
      .into_iter()
      .map(|(category, score)| Ok((decode_label::<Category>(&category, "category")?, score)))
      .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(ScorecardEntry {
      evaluation_id: decode_uuid(&self.evaluation_id)?,
      evaluated_at:  decode_dt(&self.evaluated_at)?,
      scorecard:     Scorecard {
        categories,
        overall: self.overall,
        total_records: to_u64(self.total_records),
        failed_records: to_u64(self.failed_records),
        passed: to_usize(self.passed),
        warning: to_usize(self.warning),
        failed: to_usize(self.failed),
      },
    })
  }
}

/// A `quality_results` row.
struct RawResult {
  position:           i64,
  rule:               String,
  category:           String,
  severity:           String,
  total_records:      i64,
  failed_records:     i64,
  failure_percentage: f64,
  status:             String,
}

impl RawResult {
  fn into_result(self, exceptions: Vec<Exception>) -> Result<RuleResult> {
    Ok(RuleResult {
      rule: self.rule,
      category: decode_label(&self.category, "category")?,
      severity: decode_label(&self.severity, "severity")?,
      total_records: to_u64(self.total_records),
      failed_records: to_u64(self.failed_records),
      failure_percentage: self.failure_percentage,
      status: decode_label(&self.status, "rule status")?,
      exceptions,
    })
  }
}

/// Category scores for each evaluation in `ids`.
fn select_scores(
  conn: &rusqlite::Connection,
  ids: &[String],
) -> rusqlite::Result<HashMap<String, Vec<(String, f64)>>> {
  let mut stmt = conn.prepare(
    "SELECT category, score FROM quality_scores WHERE evaluation_id = ?1 ORDER BY category",
  )?;
  let mut scores = HashMap::new();
  for id in ids {
    let rows = stmt
      .query_map(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
      .collect::<rusqlite::Result<Vec<(String, f64)>>>()?;
    scores.insert(id.clone(), rows);
  }
  Ok(scores)
}

// ─── QualityStore impl ───────────────────────────────────────────────────────

impl QualityStore for SqliteStore {
  async fn record_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
    let id = encode_uuid(evaluation.evaluation_id);
    let at = encode_dt(evaluation.evaluated_at);
    let card = evaluation.report.scorecard.clone();
    let results = evaluation.report.results.clone();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
          &format!(
            "INSERT INTO quality_evaluations ({EVALUATION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
          ),
          rusqlite::params![
            id,
            at,
            card.overall,
            to_i64(card.total_records),
            to_i64(card.failed_records),
            to_i64(card.passed),
            to_i64(card.warning),
            to_i64(card.failed),
          ],
        )?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO quality_scores (evaluation_id, category, score) VALUES (?1, ?2, ?3)",
          )?;
          for (category, score) in &card.categories {
            stmt.execute(rusqlite::params![id, category.to_string(), score])?;
          }

          let mut result_stmt = tx.prepare(
            "INSERT INTO quality_results (
               evaluation_id, position, rule, category, severity, total_records,
               failed_records, failure_percentage, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          )?;
          let mut exception_stmt = tx.prepare(
            "INSERT INTO quality_exceptions (evaluation_id, position, seq, record, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
          )?;
          for (position, result) in results.iter().enumerate() {
            let position = to_i64(position);
            result_stmt.execute(rusqlite::params![
              id,
              position,
              result.rule,
              result.category.to_string(),
              result.severity.to_string(),
              to_i64(result.total_records),
              to_i64(result.failed_records),
              result.failure_percentage,
              result.status.to_string(),
            ])?;
            for (seq, exception) in result.exceptions.iter().enumerate() {
              exception_stmt.execute(rusqlite::params![
                id,
                position,
                to_i64(seq),
                exception.record,
                exception.detail,
              ])?;
            }
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn evaluation(&self, evaluation_id: Uuid) -> Result<Option<Evaluation>> {
    let id = encode_uuid(evaluation_id);
    let loaded = self
      .conn
      .call(move |conn| {
        let Some(head) = conn
          .query_row(
            &format!(
              "SELECT {EVALUATION_COLUMNS} FROM quality_evaluations WHERE evaluation_id = ?1"
            ),
            rusqlite::params![id],
            RawEvaluation::from_row,
          )
          .optional()?
        else {
          return Ok(None);
        };

        let mut scores = select_scores(conn, std::slice::from_ref(&id))?;
        let mut stmt = conn.prepare(
          "SELECT position, rule, category, severity, total_records, failed_records,
                  failure_percentage, status
           FROM quality_results WHERE evaluation_id = ?1 ORDER BY position",
        )?;
        let results = stmt
          .query_map(rusqlite::params![id], |r| {
            Ok(RawResult {
              position:           r.get(0)?,
              rule:               r.get(1)?,
              category:           r.get(2)?,
              severity:           r.get(3)?,
              total_records:      r.get(4)?,
              failed_records:     r.get(5)?,
              failure_percentage: r.get(6)?,
              status:             r.get(7)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
          "SELECT position, record, detail FROM quality_exceptions
           WHERE evaluation_id = ?1 ORDER BY position, seq",
        )?;
        let exceptions = stmt
          .query_map(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
          .collect::<rusqlite::Result<Vec<(i64, String, String)>>>()?;

        Ok(Some((head, scores.remove(&id).unwrap_or_default(), results, exceptions)))
      })
      .await?;

    let Some((head, scores, results, exceptions)) = loaded else { return Ok(None) };
    let mut by_position: HashMap<i64, Vec<Exception>> = HashMap::new();
    for (position, record, detail) in exceptions {
      by_position.entry(position).or_default().push(Exception { record, detail });
    }
    let results = results
      .into_iter()
      .map(|raw| {
        let exceptions = by_position.remove(&raw.position).unwrap_or_default();
        raw.into_result(exceptions)
      })
      .collect::<Result<Vec<_>>>()?;
    let entry = head.into_entry(scores)?;

    Ok(Some(Evaluation {
      evaluation_id: entry.evaluation_id,
      evaluated_at:  entry.evaluated_at,
      report:        QualityReport { results, scorecard: entry.scorecard },
    }))
  }

  async fn scorecard_history(&self, limit: usize) -> Result<Vec<ScorecardEntry>> {
    let limit = to_i64(limit);
    let (heads, mut scores) = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {EVALUATION_COLUMNS} FROM quality_evaluations
           ORDER BY evaluated_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let heads = stmt
          .query_map(rusqlite::params![limit], RawEvaluation::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let ids: Vec<String> = heads.iter().map(|h| h.evaluation_id.clone()).collect();
        let scores = select_scores(conn, &ids)?;
        Ok((heads, scores))
      })
      .await?;

    heads
      .into_iter()
      .map(|head| {
        let own = scores.remove(&head.evaluation_id).unwrap_or_default();
        head.into_entry(own)
      })
      .collect()
  }
}
