//! Campaign responses: a second fact stream bound to two dimensions.
//!
//! A response names a customer and a campaign by business key. The customer
//! is resolved at the response timestamp like any event reference. The
//! campaign is looked up without a date: a response always binds to the
//! campaign's current version.
//!
//! Both references are required. A response with either one unresolved is
//! rejected and its unresolved references go to the orphan log. Responses are
//! unique on their response id.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  binder::BindTally,
  dimension::{BusinessKey, Dimension, SurrogateKey, to_store_precision},
  event::{Orphan, date_key},
  resolver::{Resolution, Resolver},
  retry::{RetryConfig, retrying},
  run::{CancelFlag, Progress},
  store::{DimensionStore, FactStore, ResponseStore},
};

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ResponseKind {
  Opened,
  Clicked,
  Converted,
}

/// One campaign response as delivered by the ingestion stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
  pub response_id:      String,
  pub responded_at:     DateTime<Utc>,
  /// Raw keys as delivered; validated by the binder.
  pub customer_key:     String,
  pub campaign_key:     String,
  pub kind:             ResponseKind,
  /// Only meaningful on a conversion.
  pub conversion_value: Decimal,
}

/// A response bound to its customer and campaign versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFact {
  pub response_id:      String,
  pub responded_at:     DateTime<Utc>,
  pub date_key:         u32,
  pub customer:         SurrogateKey,
  pub campaign:         SurrogateKey,
  pub kind:             ResponseKind,
  /// Zero unless `kind` is `Converted`.
  pub conversion_value: Decimal,
  pub bound_at:         DateTime<Utc>,
}

impl ResponseFact {
  pub fn is_opened(&self) -> bool { self.kind == ResponseKind::Opened }

  pub fn is_clicked(&self) -> bool { self.kind == ResponseKind::Clicked }

  pub fn is_converted(&self) -> bool { self.kind == ResponseKind::Converted }
}

// ─── Binder ──────────────────────────────────────────────────────────────────

/// Which dimensions a response resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
  pub customer: Dimension,
  pub campaign: Dimension,
}

impl Default for ResponseConfig {
  fn default() -> Self {
    Self { customer: Dimension::new("customer"), campaign: Dimension::new("campaign") }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
  Bound(ResponseFact),
  Duplicate,
  Rejected(Vec<Orphan>),
}

pub struct ResponseBinder<'s, S> {
  store:    &'s S,
  config:   ResponseConfig,
  retry:    RetryConfig,
  resolver: Resolver<'s, S>,
  seen:     HashSet<String>,
  orphans:  Vec<Orphan>,
  tally:    BindTally,
}

impl<'s, S: DimensionStore + FactStore + ResponseStore> ResponseBinder<'s, S> {
  pub fn new(store: &'s S, config: ResponseConfig, retry: RetryConfig) -> Self {
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

  pub fn orphans(&self) -> &[Orphan] { &self.orphans }

  pub async fn bind(&mut self, response: &ResponseRecord) -> Result<ResponseOutcome> {
    let response_id = response.response_id.trim();
    if response_id.is_empty() {
      return Err(Error::MalformedInput("response has no response id".into()));
    }
    let customer = BusinessKey::new(&response.customer_key).map_err(|_| {
      Error::MalformedInput(format!("response {response_id} has no customer key"))
    })?;
    let campaign = BusinessKey::new(&response.campaign_key).map_err(|_| {
      Error::MalformedInput(format!("response {response_id} has no campaign key"))
    })?;
    if response.conversion_value < Decimal::ZERO {
      return Err(Error::MalformedInput(format!(
        "response {response_id} has a negative conversion value"
      )));
    }

    let store = self.store;
    if self.seen.contains(response_id)
      || retrying(&self.retry, "contains_response", || store.contains_response(response_id))
        .await?
    {
      debug!(response_id, "skipping duplicate response");
      self.tally.duplicates += 1;
      return Ok(ResponseOutcome::Duplicate);
    }

    let responded_at = to_store_precision(response.responded_at);
    let at_response = self.resolver.resolve(&self.config.customer, &customer, responded_at).await?;
    let current = self.resolver.resolve_current(&self.config.campaign, &campaign).await?;

    let mut orphans = Vec::new();
    for (dimension, key, resolution) in [
      (&self.config.customer, &customer, at_response),
      (&self.config.campaign, &campaign, current),
    ] {
      if let Resolution::Unresolved(reason) = resolution {
        orphans.push(Orphan {
          event_id: response_id.to_owned(),
          dimension: dimension.clone(),
          business_key: key.to_string(),
          occurred_at: responded_at,
          reason,
        });
      }
    }
    let (Resolution::Resolved(customer_sk), Resolution::Resolved(campaign_sk)) =
      (at_response, current)
    else {
      for orphan in &orphans {
        warn!(
          response_id,
          dimension = %orphan.dimension,
          business_key = %orphan.business_key,
          reason = %orphan.reason,
          "rejecting response with unresolved reference"
        );
      }
      self.tally.rejected += 1;
      self.orphans.extend(orphans.iter().cloned());
      return Ok(ResponseOutcome::Rejected(orphans));
    };

    let conversion_value = if response.kind == ResponseKind::Converted {
      response.conversion_value
    } else {
      if !response.conversion_value.is_zero() {
        debug!(response_id, kind = %response.kind, "dropping conversion value of non-conversion");
      }
      Decimal::ZERO
    };

    let fact = ResponseFact {
      response_id: response_id.to_owned(),
      responded_at,
      date_key: date_key(responded_at),
      customer: customer_sk,
      campaign: campaign_sk,
      kind: response.kind,
      conversion_value,
      bound_at: to_store_precision(Utc::now()),
    };

    let inserted =
      retrying(&self.retry, "insert_response", || store.insert_response(&fact)).await?;
    self.seen.insert(fact.response_id.clone());
    if !inserted {
      self.tally.duplicates += 1;
      return Ok(ResponseOutcome::Duplicate);
    }

    debug!(response_id, kind = %fact.kind, "bound response");
    self.tally.bound += 1;
    Ok(ResponseOutcome::Bound(fact))
  }

  /// Bind responses until done or cancelled. Classification matches
  /// [`crate::binder::FactBinder::bind_batch`].
  pub async fn bind_batch<'a, I>(&mut self, responses: I, cancel: &CancelFlag) -> Result<Progress>
  where
    I: IntoIterator<Item = &'a ResponseRecord>,
  {
    for response in responses {
      if cancel.is_cancelled() {
        info!("response binder cancelled");
        return Ok(Progress::Cancelled);
      }

      match self.bind(response).await {
        Ok(_) => {}
        Err(e) if e.is_per_record() => {
          warn!(response_id = %response.response_id, error = %e, "skipping malformed response");
          self.tally.malformed += 1;
        }
        Err(e) if e.is_per_entity() => {
          error!(response_id = %response.response_id, error = %e, "dropping response");
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
  use chrono::TimeZone;

  use super::*;
  use crate::{
    event::UnresolvedReason,
    memory::MemoryStore,
    snapshot::Snapshot,
    writer::VersionWriter,
  };

  fn t(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, day, 8, 0, 0).unwrap() }

  fn customer() -> Dimension { Dimension::new("customer") }

  fn campaign() -> Dimension { Dimension::new("campaign") }

  /// E1 moves address on day 10; campaign C1 is renamed on day 20.
  async fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    let mut first = VersionWriter::new(&store, t(1), RetryConfig::none());
    first
      .apply_batch(
        &[
          Snapshot::new(customer(), "E1").tracked("address", "A").originated_at(t(1)),
          Snapshot::new(campaign(), "C1").tracked("name", "Spring").originated_at(t(1)),
        ],
        &CancelFlag::new(),
      )
      .await
      .unwrap();
    VersionWriter::new(&store, t(10), RetryConfig::none())
      .apply(&Snapshot::new(customer(), "E1").tracked("address", "B"))
      .await
      .unwrap();
    VersionWriter::new(&store, t(20), RetryConfig::none())
      .apply(&Snapshot::new(campaign(), "C1").tracked("name", "Spring sale"))
      .await
      .unwrap();
    store
  }

  fn response(id: &str, at: DateTime<Utc>, kind: ResponseKind, value: i64) -> ResponseRecord {
    ResponseRecord {
      response_id:      id.into(),
      responded_at:     at,
      customer_key:     "E1".into(),
      campaign_key:     "C1".into(),
      kind,
      conversion_value: Decimal::new(value, 2),
    }
  }

  fn binder(store: &MemoryStore) -> ResponseBinder<'_, MemoryStore> {
    ResponseBinder::new(store, ResponseConfig::default(), RetryConfig::none())
  }

  #[tokio::test]
  async fn customer_binds_at_response_time_and_campaign_to_current() {
    let store = seeded().await;
    let e1 = BusinessKey::new("E1").unwrap();
    let c1 = BusinessKey::new("C1").unwrap();
    let customer_history = store.history(&customer(), &e1).await.unwrap();
    let campaign_now = store.current_version(&campaign(), &c1).await.unwrap().unwrap();

    let mut binder = binder(&store);
    let outcome =
      binder.bind(&response("R1", t(5), ResponseKind::Converted, 4999)).await.unwrap();
    let ResponseOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };

    assert_eq!(fact.customer, customer_history[0].surrogate_key);
    assert_eq!(fact.campaign, campaign_now.surrogate_key);
    assert!(fact.is_converted());
    assert!(!fact.is_opened());
    assert_eq!(fact.conversion_value, Decimal::new(4999, 2));
    assert_eq!(fact.date_key, 20240305);
    assert_eq!(store.responses().await.unwrap(), vec![fact]);
  }

  #[tokio::test]
  async fn non_conversion_carries_no_value() {
    let store = seeded().await;
    let mut binder = binder(&store);
    let outcome = binder.bind(&response("R1", t(12), ResponseKind::Clicked, 500)).await.unwrap();
    let ResponseOutcome::Bound(fact) = outcome else { panic!("{outcome:?}") };
    assert!(fact.is_clicked());
    assert_eq!(fact.conversion_value, Decimal::ZERO);
  }

  #[tokio::test]
  async fn unknown_campaign_rejects_and_records_orphan() {
    let store = seeded().await;
    let mut binder = binder(&store);
    let mut stray = response("R1", t(5), ResponseKind::Opened, 0);
    stray.campaign_key = "C404".into();

    binder.bind_batch(&[stray], &CancelFlag::new()).await.unwrap();
    assert_eq!(binder.tally().rejected, 1);
    let [orphan] = binder.orphans() else { panic!("{:?}", binder.orphans()) };
    assert_eq!(orphan.event_id, "R1");
    assert_eq!(orphan.dimension, campaign());
    assert_eq!(orphan.reason, UnresolvedReason::UnknownKey);
    assert!(store.responses().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn response_before_customer_exists_is_out_of_range() {
    let store = seeded().await;
    let mut binder = binder(&store);
    let early = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let outcome = binder.bind(&response("R1", early, ResponseKind::Opened, 0)).await.unwrap();
    let ResponseOutcome::Rejected(orphans) = outcome else { panic!("{outcome:?}") };
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].dimension, customer());
    assert_eq!(orphans[0].reason, UnresolvedReason::OutOfRange);
  }

  #[tokio::test]
  async fn duplicate_and_malformed_responses_are_counted() {
    let store = seeded().await;
    let mut binder = binder(&store);
    let mut blank_customer = response("R3", t(5), ResponseKind::Opened, 0);
    blank_customer.customer_key = " ".into();
    let negative = response("R4", t(5), ResponseKind::Converted, -100);
    let batch = [
      response("R1", t(5), ResponseKind::Opened, 0),
      response("R1", t(5), ResponseKind::Opened, 0),
      blank_customer,
      negative,
    ];

    binder.bind_batch(&batch, &CancelFlag::new()).await.unwrap();
    let tally = binder.tally();
    assert_eq!((tally.bound, tally.duplicates, tally.malformed), (1, 1, 2));

    let mut again = ResponseBinder::new(&store, ResponseConfig::default(), RetryConfig::none());
    assert_eq!(again.bind(&batch[0]).await.unwrap(), ResponseOutcome::Duplicate);
  }

  #[test]
  fn response_kinds_parse_loosely() {
    assert_eq!("Converted".parse::<ResponseKind>().unwrap(), ResponseKind::Converted);
    assert_eq!(ResponseKind::Clicked.to_string(), "clicked");
    assert!("bounced".parse::<ResponseKind>().is_err());
  }
}
