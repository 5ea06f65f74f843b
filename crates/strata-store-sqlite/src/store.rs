//! [`SqliteStore`], the SQLite implementation of [`DimensionStore`] and
//! [`FactStore`]. The other store traits are implemented in sibling modules
//! on the same connection.
//!
//! Every multi-statement write runs in an immediate transaction inside one
//! `call`, so a version is closed and its successor opened atomically. The
//! closures only read and write rows; domain errors are built outside them
//! from a [`Refusal`].

use std::{
  collections::{BTreeMap, HashMap},
  path::Path,
  time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use strata_core::{
  dimension::{
    Attributes, BusinessKey, Dimension, DimensionVersion, EntityMetrics, NewVersion,
    SurrogateKey, ValidTo, VersionLookup,
  },
  event::{FactRecord, Orphan},
  run::RunSummary,
  store::{DimensionStore, FactStore, StoreBackend},
};

use crate::{
  Error, Result,
  encode::{
    RawFact, RawOrphan, RawVersion, VERSION_COLUMNS, decode_decimal, decode_dt, decode_uuid,
    encode_attrs, encode_decimal, encode_dt, encode_uuid, encode_valid_to,
  },
  schema::SCHEMA,
};

/// How long a statement waits on another connection's lock before SQLite
/// reports `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a write was refused inside a transaction.
enum Refusal {
  NoCurrent,
  CurrentExists,
  ClosesBeforeStart { surrogate_key: i64, valid_from: String },
  Overlaps(i64),
  NotFound,
  NotCurrent,
}

impl Refusal {
  fn into_error(self, dimension: &Dimension, key: &BusinessKey, closing_at: &str) -> Error {
    let detail = match self {
      Self::NoCurrent => "no current version".to_owned(),
      Self::CurrentExists => "insert while a current version exists".to_owned(),
      Self::ClosesBeforeStart { surrogate_key, valid_from } => format!(
        "closing #{surrogate_key} at {closing_at} precedes its valid_from {valid_from}"
      ),
      Self::Overlaps(sk) => format!("new version would overlap #{sk}"),
      Self::NotFound | Self::NotCurrent => "version vanished during write".to_owned(),
    };
    strata_core::Error::invariant(dimension, key, detail).into()
  }

  fn into_key_error(self, surrogate_key: SurrogateKey) -> Error {
    match self {
      Self::NotCurrent => strata_core::Error::NotCurrent(surrogate_key).into(),
      _ => strata_core::Error::VersionNotFound(surrogate_key).into(),
    }
  }
}

/// A version ready to insert, with every column already encoded.
struct EncodedVersion {
  dimension:      String,
  business_key:   String,
  tracked_json:   String,
  untracked_json: String,
  valid_from:     String,
  valid_to:       String,
  event_count:    i64,
  total_amount:   String,
}

impl EncodedVersion {
  fn new(version: &NewVersion) -> Result<Self> {
    Ok(Self {
      dimension:      version.dimension.as_str().to_owned(),
      business_key:   version.business_key.as_str().to_owned(),
      tracked_json:   encode_attrs(&version.tracked)?,
      untracked_json: encode_attrs(&version.untracked)?,
      valid_from:     encode_dt(version.valid_from),
      valid_to:       encode_valid_to(ValidTo::Open),
      event_count:    i64::try_from(version.metrics.event_count).unwrap_or(i64::MAX),
      total_amount:   encode_decimal(version.metrics.total_amount),
    })
  }
}

/// The holder of the cross-run lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLock {
  pub run_id:      Uuid,
  pub acquired_at: DateTime<Utc>,
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

fn select_current(
  conn: &rusqlite::Connection,
  dimension: &str,
  key: &str,
) -> rusqlite::Result<Option<RawVersion>> {
  conn
    .query_row(
      &format!(
        "SELECT {VERSION_COLUMNS} FROM dimension_versions
         WHERE dimension = ?1 AND business_key = ?2 AND is_current = 1"
      ),
      rusqlite::params![dimension, key],
      RawVersion::from_row,
    )
    .optional()
}

fn select_by_key(conn: &rusqlite::Connection, sk: i64) -> rusqlite::Result<Option<RawVersion>> {
  conn
    .query_row(
      &format!("SELECT {VERSION_COLUMNS} FROM dimension_versions WHERE surrogate_key = ?1"),
      rusqlite::params![sk],
      RawVersion::from_row,
    )
    .optional()
}

/// The first non-empty interval of the key that ends after `from`.
fn first_overlap(
  conn: &rusqlite::Connection,
  dimension: &str,
  key: &str,
  from: &str,
) -> rusqlite::Result<Option<i64>> {
  conn
    .query_row(
      "SELECT surrogate_key FROM dimension_versions
       WHERE dimension = ?1 AND business_key = ?2
         AND valid_from < valid_to AND valid_to > ?3
       LIMIT 1",
      rusqlite::params![dimension, key, from],
      |r| r.get(0),
    )
    .optional()
}

fn insert_row(conn: &rusqlite::Connection, v: &EncodedVersion, now: &str) -> rusqlite::Result<i64> {
  conn.execute(
    "INSERT INTO dimension_versions (
       dimension, business_key, tracked_json, untracked_json,
       valid_from, valid_to, is_current, event_count, total_amount,
       recorded_at, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?9)",
    rusqlite::params![
      v.dimension,
      v.business_key,
      v.tracked_json,
      v.untracked_json,
      v.valid_from,
      v.valid_to,
      v.event_count,
      v.total_amount,
      now,
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

fn close_row(conn: &rusqlite::Connection, sk: i64, closing_at: &str, now: &str) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE dimension_versions SET valid_to = ?2, is_current = 0, updated_at = ?3
     WHERE surrogate_key = ?1",
    rusqlite::params![sk, closing_at, now],
  )?;
  Ok(())
}

/// Read a row that was just written in the same transaction.
fn reread(conn: &rusqlite::Connection, sk: i64) -> rusqlite::Result<RawVersion> {
  select_by_key(conn, sk)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

fn query_versions(
  conn: &rusqlite::Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<RawVersion>> {
  let mut stmt = conn.prepare(sql)?;
  stmt
    .query_map(params, RawVersion::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

fn into_versions(raws: Vec<RawVersion>) -> Result<Vec<DimensionVersion>> {
  raws.into_iter().map(RawVersion::into_version).collect()
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Strata warehouse backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Run lock ──────────────────────────────────────────────────────────────

  /// Take the cross-run lock for `run_id`. Fails with [`Error::RunLocked`]
  /// while another run holds it.
  pub async fn acquire_run_lock(&self, run_id: Uuid) -> Result<RunLock> {
    let lock = RunLock { run_id, acquired_at: Utc::now() };
    let id_str = encode_uuid(run_id);
    let at_str = encode_dt(lock.acquired_at);

    let held: Option<(String, String)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = tx
          .query_row("SELECT run_id, acquired_at FROM run_lock WHERE lock_id = 1", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
          })
          .optional()?;
        if held.is_none() {
          tx.execute(
            "INSERT INTO run_lock (lock_id, run_id, acquired_at) VALUES (1, ?1, ?2)",
            rusqlite::params![id_str, at_str],
          )?;
          tx.commit()?;
        }
        Ok(held)
      })
      .await?;

    match held {
      Some((holder, since)) => Err(Error::RunLocked {
        held_by: decode_uuid(&holder)?,
        since:   decode_dt(&since)?,
      }),
      None => {
        info!(%run_id, "run lock acquired");
        Ok(lock)
      }
    }
  }

  pub async fn release_run_lock(&self, run_id: Uuid) -> Result<()> {
    let id_str = encode_uuid(run_id);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM run_lock WHERE lock_id = 1 AND run_id = ?1",
          rusqlite::params![id_str],
        )?)
      })
      .await?;
    if removed == 0 {
      return Err(Error::NotLockHolder(run_id));
    }
    info!(%run_id, "run lock released");
    Ok(())
  }

  /// Remove the lock whoever holds it, e.g. after a crashed run. Returns the
  /// lock that was removed.
  pub async fn break_run_lock(&self) -> Result<Option<RunLock>> {
    let held: Option<(String, String)> = self
      .conn
      .call(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = tx
          .query_row("SELECT run_id, acquired_at FROM run_lock WHERE lock_id = 1", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
          })
          .optional()?;
        tx.execute("DELETE FROM run_lock", [])?;
        tx.commit()?;
        Ok(held)
      })
      .await?;

    held
      .map(|(id, at)| -> Result<RunLock> {
        Ok(RunLock { run_id: decode_uuid(&id)?, acquired_at: decode_dt(&at)? })
      })
      .transpose()
  }

  // ── Run log ───────────────────────────────────────────────────────────────

  pub async fn record_run(&self, summary: &RunSummary) -> Result<()> {
    let id_str = encode_uuid(summary.run_id);
    let started = encode_dt(summary.started_at);
    let finished = encode_dt(summary.finished_at);
    let status = summary.status.to_string();
    let json = serde_json::to_string(summary)?;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO runs (run_id, started_at, finished_at, status, summary_json)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, started, finished, status, json],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// The `limit` most recently started runs, newest first.
  pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT summary_json FROM runs ORDER BY started_at DESC LIMIT ?1")?;
        let rows = stmt
          .query_map(rusqlite::params![limit], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .iter()
      .map(|json| serde_json::from_str(json).map_err(Error::from))
      .collect()
  }

  /// Orphans logged by one run, in insertion order.
  pub async fn run_orphans(&self, run_id: Uuid) -> Result<Vec<Orphan>> {
    let id_str = encode_uuid(run_id);
    let raws: Vec<RawOrphan> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, event_id, dimension, business_key, occurred_at, reason
           FROM orphans WHERE run_id = ?1 ORDER BY orphan_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |r| {
            Ok(RawOrphan {
              run_id:       r.get(0)?,
              event_id:     r.get(1)?,
              dimension:    r.get(2)?,
              business_key: r.get(3)?,
              occurred_at:  r.get(4)?,
              reason:       r.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|raw| raw.into_orphan().map(|(_, orphan)| orphan))
      .collect()
  }
}

impl StoreBackend for SqliteStore {
  type Error = Error;
}

// ─── DimensionStore impl ─────────────────────────────────────────────────────

impl DimensionStore for SqliteStore {
  async fn current_version(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
  ) -> Result<Option<DimensionVersion>> {
    let dim = dimension.as_str().to_owned();
    let bk = key.as_str().to_owned();
    let raw = self
      .conn
      .call(move |conn| Ok(select_current(conn, &dim, &bk)?))
      .await?;
    raw.map(RawVersion::into_version).transpose()
  }

  async fn version_at(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
    at: DateTime<Utc>,
  ) -> Result<VersionLookup> {
    let dim = dimension.as_str().to_owned();
    let bk = key.as_str().to_owned();
    let at_str = encode_dt(at);

    let (matches, known) = self
      .conn
      .call(move |conn| {
        let matches = query_versions(
          conn,
          &format!(
            "SELECT {VERSION_COLUMNS} FROM dimension_versions
             WHERE dimension = ?1 AND business_key = ?2
               AND valid_from <= ?3 AND valid_to > ?3
             ORDER BY valid_from, surrogate_key
             LIMIT 2"
          ),
          rusqlite::params![dim, bk, at_str],
        )?;
        let known: bool = conn.query_row(
          "SELECT EXISTS (
             SELECT 1 FROM dimension_versions WHERE dimension = ?1 AND business_key = ?2
           )",
          rusqlite::params![dim, bk],
          |r| r.get(0),
        )?;
        Ok((matches, known))
      })
      .await?;

    let mut matches = into_versions(matches)?;
    match (matches.len(), known) {
      (0, false) => Ok(VersionLookup::UnknownKey),
      (0, true) => Ok(VersionLookup::OutOfRange),
      (1, _) => Ok(VersionLookup::Found(matches.remove(0))),
      _ => Err(
        strata_core::Error::invariant(
          dimension,
          key,
          format!(
            "versions {} and {} both contain {}",
            matches[0].surrogate_key,
            matches[1].surrogate_key,
            at.to_rfc3339()
          ),
        )
        .into(),
      ),
    }
  }

  async fn insert_version(&self, version: NewVersion) -> Result<DimensionVersion> {
    let encoded = EncodedVersion::new(&version)?;
    let now = encode_dt(Utc::now());

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if select_current(&tx, &encoded.dimension, &encoded.business_key)?.is_some() {
          return Ok(Err(Refusal::CurrentExists));
        }
        if let Some(sk) =
          first_overlap(&tx, &encoded.dimension, &encoded.business_key, &encoded.valid_from)?
        {
          return Ok(Err(Refusal::Overlaps(sk)));
        }
        let sk = insert_row(&tx, &encoded, &now)?;
        let raw = reread(&tx, sk)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await?;

    let raw = outcome
      .map_err(|r| r.into_error(&version.dimension, &version.business_key, ""))?;
    let created = raw.into_version()?;
    debug!(
      dimension = %created.dimension,
      business_key = %created.business_key,
      surrogate_key = %created.surrogate_key,
      "inserted version"
    );
    Ok(created)
  }

  async fn close_current_version(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
    closing_at: DateTime<Utc>,
  ) -> Result<DimensionVersion> {
    let dim = dimension.as_str().to_owned();
    let bk = key.as_str().to_owned();
    let closing = encode_valid_to(ValidTo::At(closing_at));
    let now = encode_dt(Utc::now());
    let closing_for_error = closing.clone();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = select_current(&tx, &dim, &bk)? else {
          return Ok(Err(Refusal::NoCurrent));
        };
        if closing < current.valid_from {
          return Ok(Err(Refusal::ClosesBeforeStart {
            surrogate_key: current.surrogate_key,
            valid_from:    current.valid_from,
          }));
        }
        close_row(&tx, current.surrogate_key, &closing, &now)?;
        let raw = reread(&tx, current.surrogate_key)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await?;

    outcome
      .map_err(|r| r.into_error(dimension, key, &closing_for_error))?
      .into_version()
  }

  async fn supersede_current(
    &self,
    successor: NewVersion,
  ) -> Result<(DimensionVersion, DimensionVersion)> {
    let encoded = EncodedVersion::new(&successor)?;
    let now = encode_dt(Utc::now());
    let closing_for_error = encoded.valid_from.clone();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = select_current(&tx, &encoded.dimension, &encoded.business_key)?
        else {
          return Ok(Err(Refusal::NoCurrent));
        };
        if encoded.valid_from < current.valid_from {
          return Ok(Err(Refusal::ClosesBeforeStart {
            surrogate_key: current.surrogate_key,
            valid_from:    current.valid_from,
          }));
        }
        close_row(&tx, current.surrogate_key, &encoded.valid_from, &now)?;
        if let Some(sk) =
          first_overlap(&tx, &encoded.dimension, &encoded.business_key, &encoded.valid_from)?
        {
          return Ok(Err(Refusal::Overlaps(sk)));
        }
        let opened = insert_row(&tx, &encoded, &now)?;
        let closed = reread(&tx, current.surrogate_key)?;
        let opened = reread(&tx, opened)?;
        tx.commit()?;
        Ok(Ok((closed, opened)))
      })
      .await?;

    let (closed, opened) = outcome.map_err(|r| {
      r.into_error(&successor.dimension, &successor.business_key, &closing_for_error)
    })?;
    let (closed, opened) = (closed.into_version()?, opened.into_version()?);
    debug!(
      dimension = %opened.dimension,
      business_key = %opened.business_key,
      closed = %closed.surrogate_key,
      opened = %opened.surrogate_key,
      "superseded version"
    );
    Ok((closed, opened))
  }

  async fn update_untracked(
    &self,
    surrogate_key: SurrogateKey,
    untracked: Attributes,
  ) -> Result<DimensionVersion> {
    let json = encode_attrs(&untracked)?;
    let now = encode_dt(Utc::now());
    let sk = surrogate_key.0;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match select_by_key(&tx, sk)? {
          None => return Ok(Err(Refusal::NotFound)),
          Some(v) if !v.is_current => return Ok(Err(Refusal::NotCurrent)),
          Some(_) => {}
        }
        tx.execute(
          "UPDATE dimension_versions SET untracked_json = ?2, updated_at = ?3
           WHERE surrogate_key = ?1",
          rusqlite::params![sk, json, now],
        )?;
        let raw = reread(&tx, sk)?;
        tx.commit()?;
        Ok(Ok(raw))
      })
      .await?;

    outcome.map_err(|r| r.into_key_error(surrogate_key))?.into_version()
  }

  async fn write_metrics(&self, surrogate_key: SurrogateKey, metrics: EntityMetrics) -> Result<()> {
    let count = i64::try_from(metrics.event_count).unwrap_or(i64::MAX);
    let total = encode_decimal(metrics.total_amount);
    let now = encode_dt(Utc::now());
    let sk = surrogate_key.0;

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match select_by_key(&tx, sk)? {
          None => return Ok(Err(Refusal::NotFound)),
          Some(v) if !v.is_current => return Ok(Err(Refusal::NotCurrent)),
          Some(_) => {}
        }
        tx.execute(
          "UPDATE dimension_versions SET event_count = ?2, total_amount = ?3, updated_at = ?4
           WHERE surrogate_key = ?1",
          rusqlite::params![sk, count, total, now],
        )?;
        tx.commit()?;
        Ok(Ok(()))
      })
      .await?;

    outcome.map_err(|r| r.into_key_error(surrogate_key))
  }

  async fn history(
    &self,
    dimension: &Dimension,
    key: &BusinessKey,
  ) -> Result<Vec<DimensionVersion>> {
    let dim = dimension.as_str().to_owned();
    let bk = key.as_str().to_owned();
    let raws = self
      .conn
      .call(move |conn| {
        Ok(query_versions(
          conn,
          &format!(
            "SELECT {VERSION_COLUMNS} FROM dimension_versions
             WHERE dimension = ?1 AND business_key = ?2
             ORDER BY valid_from, surrogate_key"
          ),
          rusqlite::params![dim, bk],
        )?)
      })
      .await?;
    into_versions(raws)
  }

  async fn versions(&self, dimension: &Dimension) -> Result<Vec<DimensionVersion>> {
    let dim = dimension.as_str().to_owned();
    let raws = self
      .conn
      .call(move |conn| {
        Ok(query_versions(
          conn,
          &format!(
            "SELECT {VERSION_COLUMNS} FROM dimension_versions
             WHERE dimension = ?1
             ORDER BY business_key, valid_from, surrogate_key"
          ),
          rusqlite::params![dim],
        )?)
      })
      .await?;
    into_versions(raws)
  }

  async fn business_keys(&self, dimension: &Dimension) -> Result<Vec<BusinessKey>> {
    let dim = dimension.as_str().to_owned();
    let keys: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT business_key FROM dimension_versions
           WHERE dimension = ?1 ORDER BY business_key",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![dim], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    keys
      .into_iter()
      .map(|k| BusinessKey::new(k).map_err(Error::from))
      .collect()
  }

  async fn dimensions(&self) -> Result<Vec<Dimension>> {
    let dims: Vec<String> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT DISTINCT dimension FROM dimension_versions ORDER BY dimension")?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(dims.into_iter().map(Dimension::new).collect())
  }
}

// ─── FactStore impl ──────────────────────────────────────────────────────────

impl FactStore for SqliteStore {
  async fn contains_fact(&self, event_id: &str) -> Result<bool> {
    let id = event_id.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT EXISTS (SELECT 1 FROM facts WHERE event_id = ?1)",
          rusqlite::params![id],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(exists)
  }

  async fn insert_fact(&self, fact: &FactRecord) -> Result<bool> {
    let event_id = fact.event_id.clone();
    let occurred_at = encode_dt(fact.occurred_at);
    let date_key = fact.date_key;
    let m = &fact.measures;
    let quantity = m.quantity;
    let amounts = [
      encode_decimal(m.unit_price),
      encode_decimal(m.gross_amount),
      encode_decimal(m.discount_amount),
      encode_decimal(m.tax_amount),
      encode_decimal(m.shipping_amount),
      encode_decimal(fact.net_amount),
    ];
    let bound_at = encode_dt(fact.bound_at);
    let keys: Vec<(String, i64)> = fact
      .keys
      .iter()
      .map(|(dim, sk)| (dim.as_str().to_owned(), sk.0))
      .collect();

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let [unit_price, gross, discount, tax, shipping, net] = amounts;
        let changed = tx.execute(
          "INSERT OR IGNORE INTO facts (
             event_id, occurred_at, date_key, quantity, unit_price, gross_amount,
             discount_amount, tax_amount, shipping_amount, net_amount, bound_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
          rusqlite::params![
            event_id,
            occurred_at,
            date_key,
            quantity,
            unit_price,
            gross,
            discount,
            tax,
            shipping,
            net,
            bound_at,
          ],
        )?;
        if changed == 0 {
          return Ok(false);
        }
        {
          let mut stmt = tx.prepare(
            "INSERT INTO fact_keys (event_id, dimension, surrogate_key) VALUES (?1, ?2, ?3)",
          )?;
          for (dim, sk) in &keys {
            stmt.execute(rusqlite::params![event_id, dim, sk])?;
          }
        }
        tx.commit()?;
        Ok(true)
      })
      .await?;
    Ok(inserted)
  }

  async fn totals_by_surrogate(
    &self,
    dimension: &Dimension,
  ) -> Result<Vec<(SurrogateKey, EntityMetrics)>> {
    let dim = dimension.as_str().to_owned();
    let rows: Vec<(i64, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT k.surrogate_key, f.net_amount
           FROM fact_keys k JOIN facts f ON f.event_id = k.event_id
           WHERE k.dimension = ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![dim], |r| Ok((r.get(0)?, r.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    // Summed in Rust: SQLite would coerce the decimal text to floating point.
    let mut totals: BTreeMap<SurrogateKey, EntityMetrics> = BTreeMap::new();
    for (sk, net) in rows {
      let sk = SurrogateKey(sk);
      let amount = decode_decimal(&net)?;
      let entry = totals.entry(sk).or_default();
      *entry = entry.checked_add_event(amount).ok_or_else(|| {
        strata_core::Error::Store(format!("decimal overflow summing facts for {sk}").into())
      })?;
    }
    Ok(totals.into_iter().collect())
  }

  async fn fact_count(&self) -> Result<u64> {
    let count: i64 = self
      .conn
      .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?))
      .await?;
    Ok(u64::try_from(count).unwrap_or_default())
  }

  async fn facts(&self) -> Result<Vec<FactRecord>> {
    let (raws, keys) = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT event_id, occurred_at, date_key, quantity, unit_price, gross_amount,
                  discount_amount, tax_amount, shipping_amount, net_amount, bound_at
           FROM facts ORDER BY event_id",
        )?;
        let raws = stmt
          .query_map([], RawFact::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT event_id, dimension, surrogate_key FROM fact_keys")?;
        let keys = stmt
          .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
          .collect::<rusqlite::Result<Vec<(String, String, i64)>>>()?;
        Ok((raws, keys))
      })
      .await?;

    let mut by_event: HashMap<String, BTreeMap<Dimension, SurrogateKey>> = HashMap::new();
    for (event_id, dim, sk) in keys {
      by_event
        .entry(event_id)
        .or_default()
        .insert(Dimension::new(dim), SurrogateKey(sk));
    }

    raws
      .into_iter()
      .map(|raw| {
        let keys = by_event.remove(&raw.event_id).unwrap_or_default();
        raw.into_fact(keys)
      })
      .collect()
  }

  async fn record_orphans(&self, run_id: Uuid, orphans: &[Orphan]) -> Result<()> {
    let id_str = encode_uuid(run_id);
    let rows: Vec<[String; 5]> = orphans
      .iter()
      .map(|o| {
        [
          o.event_id.clone(),
          o.dimension.as_str().to_owned(),
          o.business_key.clone(),
          encode_dt(o.occurred_at),
          o.reason.to_string(),
        ]
      })
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO orphans (run_id, event_id, dimension, business_key, occurred_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for [event_id, dim, key, at, reason] in &rows {
            stmt.execute(rusqlite::params![id_str, event_id, dim, key, at, reason])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
