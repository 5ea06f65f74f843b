//! The fact binder: turns event records into fact records.
//!
//! Each dimension reference of an event is resolved at the event's
//! timestamp. An event with any unresolved required reference is rejected.
//! Every unresolved reference, required or optional, is collected as an
//! [`Orphan`]; an optional one leaves its dimension off an otherwise bound
//! fact. Bound facts carry surrogate keys in place of business keys and an
//! exact decimal `net_amount`.
//!
//! An event must reference at least one dimension. A blank key is malformed
//! on a required dimension and means "no reference" on an optional one.
//!
//! Binding is idempotent on the event id: an id already seen in this run or
//! already stored is skipped as a duplicate.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  dimension::{BusinessKey, Dimension, to_store_precision},
  event::{EventRecord, FactRecord, Orphan, date_key},
  resolver::{Resolution, Resolver},
  retry::{RetryConfig, retrying},
  run::{CancelFlag, Progress},
  store::{DimensionStore, FactStore},
};

/// Binder configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
  /// Dimensions every event must reference and resolve. When empty, every
  /// reference an event carries is required.
  pub required_dimensions: Vec<Dimension>,
}

impl BinderConfig {
  pub fn is_required(&self, dimension: &Dimension) -> bool {
    self.required_dimensions.is_empty() || self.required_dimensions.contains(dimension)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindOutcome {
  Bound(FactRecord),
  Duplicate,
  Rejected(Vec<Orphan>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindTally {
  pub bound:                u64,
  pub duplicates:           u64,
  pub rejected:             u64,
  pub malformed:            u64,
  pub invariant_violations: u64,
}

pub struct FactBinder<'s, S> {
  store:    &'s S,
  config:   BinderConfig,
  retry:    RetryConfig,
  resolver: Resolver<'s, S>,
  seen:     HashSet<String>,
  orphans:  Vec<Orphan>,
  tally:    BindTally,
}

impl<'s, S: DimensionStore + FactStore> FactBinder<'s, S> {
  pub fn new(store: &'s S, config: BinderConfig, retry: RetryConfig) -> Self {
    Self {
      store,
      config,
      resolver: Resolver::new(store, retry.clone()),
      retry,
      seen: HashSet::new(),
      orphans: Vec::new(),
      tally: BindTally::default(),
    }
  }

  pub fn tally(&self) -> BindTally { self.tally }

  /// Orphans collected so far, in event order.
  pub fn orphans(&self) -> &[Orphan] { &self.orphans }

  /// Bind one event. Outcomes are counted; errors are returned unclassified.
  pub async fn bind(&mut self, event: &EventRecord) -> Result<BindOutcome> {
    if event.event_id.trim().is_empty() {
      return Err(Error::MalformedInput("event has no event id".into()));
    }

    let store = self.store;
    let event_id = event.event_id.as_str();
    if self.seen.contains(event_id)
      || retrying(&self.retry, "contains_fact", || store.contains_fact(event_id)).await?
    {
      debug!(event_id, "skipping duplicate event");
      self.tally.duplicates += 1;
      return Ok(BindOutcome::Duplicate);
    }

    if event.refs.is_empty() {
      return Err(Error::MalformedInput(format!("event {event_id} references no dimension")));
    }
    for required in &self.config.required_dimensions {
      if !event.refs.iter().any(|r| &r.dimension == required) {
        return Err(Error::MalformedInput(format!(
          "event {event_id} has no {required} reference"
        )));
      }
    }

    let occurred_at = to_store_precision(event.occurred_at);
    let mut keys = BTreeMap::new();
    let mut seen_dimensions = HashSet::new();
    let mut orphans = Vec::new();
    let mut rejected = false;
    for reference in &event.refs {
      let dimension = &reference.dimension;
      if !seen_dimensions.insert(dimension) {
        return Err(Error::MalformedInput(format!(
          "event {event_id} references {dimension} more than once"
        )));
      }
      let required = self.config.is_required(dimension);
      let key = match BusinessKey::new(&reference.business_key) {
        Ok(key) => key,
        Err(_) if required => {
          return Err(Error::MalformedInput(format!(
            "event {event_id} has an empty {dimension} key"
          )));
        }
        Err(_) => {
          debug!(event_id, %dimension, "optional reference left blank");
          continue;
        }
      };

      match self.resolver.resolve(dimension, &key, occurred_at).await? {
        Resolution::Resolved(sk) => {
          keys.insert(dimension.clone(), sk);
        }
        Resolution::Unresolved(reason) => {
          rejected |= required;
          orphans.push(Orphan {
            event_id: event.event_id.clone(),
            dimension: dimension.clone(),
            business_key: key.to_string(),
            occurred_at,
            reason,
          });
        }
      }
    }

    if rejected {
      for orphan in &orphans {
        warn!(
          event_id,
          dimension = %orphan.dimension,
          business_key = %orphan.business_key,
          occurred_at = %orphan.occurred_at.to_rfc3339(),
          reason = %orphan.reason,
          "rejecting fact with unresolved reference"
        );
      }
      self.tally.rejected += 1;
      self.orphans.extend(orphans.iter().cloned());
      return Ok(BindOutcome::Rejected(orphans));
    }

    let net_amount = event.measures.net_amount().ok_or_else(|| {
      Error::MalformedInput(format!("event {event_id}: net amount overflows"))
    })?;

    let fact = FactRecord {
      event_id: event.event_id.clone(),
      occurred_at,
      date_key: date_key(occurred_at),
      keys,
      measures: event.measures.clone(),
      net_amount,
      bound_at: to_store_precision(Utc::now()),
    };

    let inserted = retrying(&self.retry, "insert_fact", || store.insert_fact(&fact)).await?;
    self.seen.insert(fact.event_id.clone());
    if !inserted {
      debug!(event_id, "fact already stored");
      self.tally.duplicates += 1;
      return Ok(BindOutcome::Duplicate);
    }

    for orphan in orphans {
      warn!(
        event_id,
        dimension = %orphan.dimension,
        business_key = %orphan.business_key,
        reason = %orphan.reason,
        "bound fact without optional reference"
      );
      self.orphans.push(orphan);
    }
    debug!(event_id, date_key = fact.date_key, "bound fact");
    self.tally.bound += 1;
    Ok(BindOutcome::Bound(fact))
  }

  /// Bind events until done or cancelled.
  ///
  /// Malformed events are counted and skipped. An invariant violation met
  /// while resolving drops that event only.
  pub async fn bind_batch<'a, I>(&mut self, events: I, cancel: &CancelFlag) -> Result<Progress>
  where
    I: IntoIterator<Item = &'a EventRecord>,
  {
    for event in events {
      if cancel.is_cancelled() {
        info!("fact binder cancelled");
        return Ok(Progress::Cancelled);
      }

      match self.bind(event).await {
        Ok(_) => {}
        Err(e) if e.is_per_record() => {
          warn!(event_id = %event.event_id, error = %e, "skipping malformed event");
          self.tally.malformed += 1;
        }
        Err(e) if e.is_per_entity() => {
          error!(event_id = %event.event_id, error = %e, "dropping event");
          self.tally.invariant_violations += 1;
        }
        Err(e) => return Err(e),
      }
    }
    Ok(Progress::Completed)
  }
}

#[cfg(test)]
mod tests {
  use chrono::{DateTime, TimeZone};
  use rust_decimal::Decimal;

  use super::*;
  use crate::{
    event::{DimensionRef, Measures, UnresolvedReason},
    memory::MemoryStore,
    snapshot::Snapshot,
    writer::VersionWriter,
  };

  fn t(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 8, day, 9, 30, 0).unwrap() }

  fn customer() -> Dimension { Dimension::new("customer") }

  fn product() -> Dimension { Dimension::new("product") }

  async fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    let mut w = VersionWriter::new(&store, t(2), RetryConfig::none());
    w.apply_batch(
      &[
        Snapshot::new(customer(), "E1").tracked("address", "A").originated_at(t(1)),
        Snapshot::new(product(), "P1").tracked("category", "tools").originated_at(t(1)),
      ],
      &CancelFlag::new(),
    )
    .await
    .unwrap();
    store
  }

  fn sale(id: &str, at: DateTime<Utc>, customer_key: &str) -> EventRecord {
    EventRecord {
      event_id:    id.into(),
      occurred_at: at,
      refs:        vec![
        DimensionRef::new(customer(), customer_key),
        DimensionRef::new(product(), "P1"),
      ],
      measures:    Measures {
        quantity: 2,
        unit_price: Decimal::new(1050, 2),
        gross_amount: Decimal::new(2100, 2),
        discount_amount: Decimal::new(210, 2),
        ..Default::default()
      },
    }
  }

  #[tokio::test]
  async fn binds_with_surrogate_keys_and_exact_net_amount() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());

    let outcome = binder.bind(&sale("S1", t(5), "E1")).await.unwrap();
    let BindOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };

    assert_eq!(fact.keys.len(), 2);
    assert_eq!(fact.net_amount, Decimal::new(1890, 2));
    assert_eq!(fact.date_key, 20240805);
    assert_eq!(store.fact_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn unknown_key_rejects_fact_and_records_orphan() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());

    binder
      .bind_batch(&[sale("S1", t(5), "E99")], &CancelFlag::new())
      .await
      .unwrap();

    assert_eq!(binder.tally().rejected, 1);
    assert_eq!(binder.tally().bound, 0);
    assert_eq!(binder.orphans().len(), 1);
    let orphan = &binder.orphans()[0];
    assert_eq!(orphan.business_key, "E99");
    assert_eq!(orphan.dimension, customer());
    assert_eq!(orphan.occurred_at, t(5));
    assert_eq!(orphan.reason, UnresolvedReason::UnknownKey);
    assert_eq!(store.fact_count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn event_before_origination_is_out_of_range() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    let early = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

    let outcome = binder.bind(&sale("S1", early, "E1")).await.unwrap();
    let BindOutcome::Rejected(orphans) = outcome else { panic!("{outcome:?}") };
    assert_eq!(orphans.len(), 2);
    assert!(orphans.iter().all(|o| o.reason == UnresolvedReason::OutOfRange));
  }

  #[tokio::test]
  async fn same_event_twice_binds_once() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    let events = [sale("S1", t(5), "E1"), sale("S1", t(5), "E1")];
    binder.bind_batch(&events, &CancelFlag::new()).await.unwrap();
    assert_eq!(binder.tally().bound, 1);
    assert_eq!(binder.tally().duplicates, 1);

    // A fresh binder sees the stored fact.
    let mut again = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    assert_eq!(again.bind(&events[0]).await.unwrap(), BindOutcome::Duplicate);
    assert_eq!(store.fact_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn missing_required_dimension_is_malformed() {
    let store = seeded().await;
    let config = BinderConfig { required_dimensions: vec![customer(), product()] };
    let mut binder = FactBinder::new(&store, config, RetryConfig::none());

    let mut event = sale("S1", t(5), "E1");
    event.refs.retain(|r| r.dimension == customer());
    let err = binder.bind(&event).await.unwrap_err();
    assert!(matches!(err, Error::MalformedInput(_)));
  }

  #[tokio::test]
  async fn optional_dimension_may_stay_unresolved() {
    let store = seeded().await;
    let config = BinderConfig { required_dimensions: vec![product()] };
    let mut binder = FactBinder::new(&store, config, RetryConfig::none());

    let outcome = binder.bind(&sale("S1", t(5), "E99")).await.unwrap();
    let BindOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };
    assert!(!fact.keys.contains_key(&customer()));
    assert!(fact.keys.contains_key(&product()));
    assert_eq!(binder.tally().bound, 1);

    let [orphan] = binder.orphans() else { panic!("{:?}", binder.orphans()) };
    assert_eq!(orphan.event_id, "S1");
    assert_eq!(orphan.dimension, customer());
    assert_eq!(orphan.business_key, "E99");
    assert_eq!(orphan.reason, UnresolvedReason::UnknownKey);
  }

  #[tokio::test]
  async fn blank_optional_key_binds_without_that_dimension() {
    let store = seeded().await;
    let config = BinderConfig { required_dimensions: vec![product()] };
    let mut binder = FactBinder::new(&store, config, RetryConfig::none());

    let outcome = binder.bind(&sale("S1", t(5), "")).await.unwrap();
    let BindOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };
    assert_eq!(fact.keys.keys().collect::<Vec<_>>(), [&product()]);
    assert!(binder.orphans().is_empty());
  }

  #[tokio::test]
  async fn event_without_references_is_malformed() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());

    let mut event = sale("S1", t(5), "E1");
    event.refs.clear();
    let err = binder.bind(&event).await.unwrap_err();
    assert!(matches!(err, Error::MalformedInput(_)), "{err:?}");
    assert_eq!(store.fact_count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn occurrence_is_cut_to_whole_microseconds() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());

    let at = t(5) + chrono::Duration::nanoseconds(1_999);
    let outcome = binder.bind(&sale("S1", at, "E1")).await.unwrap();
    let BindOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };
    assert_eq!(fact.occurred_at, t(5) + chrono::Duration::microseconds(1));
    assert_eq!(fact.bound_at, to_store_precision(fact.bound_at));
  }

  #[tokio::test]
  async fn blank_event_id_and_blank_key_are_malformed() {
    let store = seeded().await;
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    let events = [sale(" ", t(5), "E1"), sale("S2", t(5), "")];
    binder.bind_batch(&events, &CancelFlag::new()).await.unwrap();
    assert_eq!(binder.tally().malformed, 2);
  }
}
