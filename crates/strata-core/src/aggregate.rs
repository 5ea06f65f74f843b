//! Post-load aggregate tables derived from bound facts.
//!
//! Two tables are rebuilt from scratch after every completed run:
//!
//! - customer monthly: one row per customer version and calendar month;
//! - product daily: one row per product version and calendar day.
//!
//! Both group on surrogate keys, so a customer who moved mid-month gets one
//! row per version. Product cost uses the `unit_cost` attribute of the
//! version the fact was bound to; a day with any fact lacking a cost has no
//! cost or profit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
  Error, Result,
  dimension::{Dimension, SurrogateKey},
  event::FactRecord,
  retry::{RetryConfig, retrying},
  store::{AggregateStore, DimensionStore, FactStore},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
  pub customer:  Dimension,
  pub product:   Dimension,
  /// Product attribute holding the per-unit cost.
  pub unit_cost: String,
}

impl Default for AggregateConfig {
  fn default() -> Self {
    Self {
      customer:  Dimension::new("customer"),
      product:   Dimension::new("product"),
      unit_cost: "unit_cost".into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerMonth {
  pub customer:       SurrogateKey,
  /// `YYYYMM`.
  pub year_month:     u32,
  pub month_start:    NaiveDate,
  pub month_end:      NaiveDate,
  pub transactions:   u64,
  pub quantity:       i64,
  pub net_total:      Decimal,
  pub discount_total: Decimal,
  /// Mean net amount per transaction, to the cent.
  pub average_net:    Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDay {
  pub product:          SurrogateKey,
  pub date_key:         u32,
  pub units_sold:       i64,
  pub revenue:          Decimal,
  pub cost:             Option<Decimal>,
  pub profit:           Option<Decimal>,
  pub unique_customers: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregates {
  /// Ordered by customer then month.
  pub customer_monthly: Vec<CustomerMonth>,
  /// Ordered by product then day.
  pub product_daily:    Vec<ProductDay>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTally {
  pub customer_months: u64,
  pub product_days:    u64,
}

// ─── Building ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MonthAcc {
  transactions: u64,
  quantity:     i64,
  net:          Decimal,
  discount:     Decimal,
}

struct DayAcc {
  units:     i64,
  revenue:   Decimal,
  cost:      Option<Decimal>,
  customers: BTreeSet<SurrogateKey>,
}

impl Default for DayAcc {
  fn default() -> Self {
    Self { units: 0, revenue: Decimal::ZERO, cost: Some(Decimal::ZERO), customers: BTreeSet::new() }
  }
}

fn overflow(what: &str) -> Error { Error::Store(format!("decimal overflow in {what}").into()) }

/// Build both tables from `facts`. `unit_costs` maps product surrogate keys to
/// their per-unit cost.
pub fn build_aggregates(
  facts: &[FactRecord],
  unit_costs: &HashMap<SurrogateKey, Decimal>,
  config: &AggregateConfig,
) -> Result<Aggregates> {
  let mut months: BTreeMap<(SurrogateKey, u32), MonthAcc> = BTreeMap::new();
  let mut days: BTreeMap<(SurrogateKey, u32), DayAcc> = BTreeMap::new();

  for fact in facts {
    let customer = fact.keys.get(&config.customer).copied();
    if let Some(customer) = customer {
      let acc = months.entry((customer, fact.date_key / 100)).or_default();
      acc.transactions += 1;
      acc.quantity = acc
        .quantity
        .checked_add(fact.measures.quantity)
        .ok_or_else(|| overflow("monthly quantity"))?;
      acc.net = acc.net.checked_add(fact.net_amount).ok_or_else(|| overflow("monthly net"))?;
      acc.discount = acc
        .discount
        .checked_add(fact.measures.discount_amount)
        .ok_or_else(|| overflow("monthly discount"))?;
    }

    if let Some(product) = fact.keys.get(&config.product).copied() {
      let acc = days.entry((product, fact.date_key)).or_default();
      acc.units = acc
        .units
        .checked_add(fact.measures.quantity)
        .ok_or_else(|| overflow("daily units"))?;
      acc.revenue =
        acc.revenue.checked_add(fact.net_amount).ok_or_else(|| overflow("daily revenue"))?;
      acc.cost = match (acc.cost, unit_costs.get(&product)) {
        (Some(sum), Some(unit)) => Some(
          unit
            .checked_mul(Decimal::from(fact.measures.quantity))
            .and_then(|line| sum.checked_add(line))
            .ok_or_else(|| overflow("daily cost"))?,
        ),
        _ => None,
      };
      acc.customers.extend(customer);
    }
  }

  let customer_monthly = months
    .into_iter()
    .map(|((customer, year_month), acc)| {
      let (month_start, month_end) = month_bounds(year_month)?;
      let average_net = acc
        .net
        .checked_div(Decimal::from(acc.transactions))
        .ok_or_else(|| overflow("monthly average"))?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
      Ok(CustomerMonth {
        customer,
        year_month,
        month_start,
        month_end,
        transactions: acc.transactions,
        quantity: acc.quantity,
        net_total: acc.net,
        discount_total: acc.discount,
        average_net,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let product_daily = days
    .into_iter()
    .map(|((product, date_key), acc)| {
      let profit = match acc.cost {
        Some(cost) => Some(acc.revenue.checked_sub(cost).ok_or_else(|| overflow("daily profit"))?),
        None => None,
      };
      Ok(ProductDay {
        product,
        date_key,
        units_sold: acc.units,
        revenue: acc.revenue,
        cost: acc.cost,
        profit,
        unique_customers: acc.customers.len() as u64,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  Ok(Aggregates { customer_monthly, product_daily })
}

/// First and last day of the month `YYYYMM`.
fn month_bounds(year_month: u32) -> Result<(NaiveDate, NaiveDate)> {
  let year = i32::try_from(year_month / 100).unwrap_or(i32::MAX);
  let month = year_month % 100;
  let start = NaiveDate::from_ymd_opt(year, month, 1);
  let next = if month == 12 {
    NaiveDate::from_ymd_opt(year.saturating_add(1), 1, 1)
  } else {
    NaiveDate::from_ymd_opt(year, month + 1, 1)
  };
  match (start, next.and_then(|n| n.pred_opt())) {
    (Some(start), Some(end)) => Ok((start, end)),
    _ => Err(Error::MalformedInput(format!("{year_month} is not a calendar month"))),
  }
}

// ─── Refresh ─────────────────────────────────────────────────────────────────

/// Rebuild both aggregate tables from every stored fact.
pub async fn refresh_aggregates<S>(
  store: &S,
  config: &AggregateConfig,
  retry: &RetryConfig,
) -> Result<AggregateTally>
where
  S: DimensionStore + FactStore + AggregateStore,
{
  let facts = retrying(retry, "facts", || store.facts()).await?;
  let products = retrying(retry, "versions", || store.versions(&config.product)).await?;

  let mut unit_costs = HashMap::new();
  for version in &products {
    let Some(raw) = version.attribute(&config.unit_cost) else { continue };
    match raw.trim().parse::<Decimal>() {
      Ok(cost) => {
        unit_costs.insert(version.surrogate_key, cost);
      }
      Err(e) => {
        debug!(
          surrogate_key = %version.surrogate_key,
          value = raw,
          error = %e,
          "ignoring unparseable unit cost"
        );
      }
    }
  }

  let aggregates = build_aggregates(&facts, &unit_costs, config)?;
  retrying(retry, "replace_aggregates", || store.replace_aggregates(&aggregates)).await?;

  let tally = AggregateTally {
    customer_months: aggregates.customer_monthly.len() as u64,
    product_days:    aggregates.product_daily.len() as u64,
  };
  info!(
    customer_months = tally.customer_months,
    product_days = tally.product_days,
    "aggregates rebuilt"
  );
  Ok(tally)
}

#[cfg(test)]
mod tests {
  use chrono::{DateTime, Datelike, TimeZone, Utc};

  use super::*;
  use crate::event::{Measures, date_key};

  fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 14, 0, 0).unwrap()
  }

  fn fact(
    id: &str,
    ts: DateTime<Utc>,
    customer: i64,
    product: i64,
    qty: i64,
    cents: i64,
  ) -> FactRecord {
    let gross = Decimal::new(cents, 2);
    let discount = Decimal::new(cents / 10, 2);
    FactRecord {
      event_id:    id.into(),
      occurred_at: ts,
      date_key:    date_key(ts),
      keys:        BTreeMap::from([
        (Dimension::new("customer"), SurrogateKey(customer)),
        (Dimension::new("product"), SurrogateKey(product)),
      ]),
      measures:    Measures {
        quantity: qty,
        gross_amount: gross,
        discount_amount: discount,
        ..Default::default()
      },
      net_amount:  gross - discount,
      bound_at:    ts,
    }
  }

  #[test]
  fn customer_months_group_by_version_and_month() {
    let facts = [
      fact("S1", at(2, 3), 1, 10, 2, 1000),
      fact("S2", at(2, 28), 1, 10, 1, 2000),
      fact("S3", at(3, 1), 1, 10, 1, 500),
      fact("S4", at(2, 9), 2, 10, 4, 4000),
    ];
    let built = build_aggregates(&facts, &HashMap::new(), &AggregateConfig::default()).unwrap();

    let feb = &built.customer_monthly[0];
    assert_eq!((feb.customer, feb.year_month), (SurrogateKey(1), 202402));
    assert_eq!(feb.transactions, 2);
    assert_eq!(feb.quantity, 3);
    assert_eq!(feb.net_total, Decimal::new(2700, 2));
    assert_eq!(feb.discount_total, Decimal::new(300, 2));
    assert_eq!(feb.average_net, Decimal::new(1350, 2));
    assert_eq!(feb.month_start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    assert_eq!(feb.month_end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

    let months: Vec<_> =
      built.customer_monthly.iter().map(|m| (m.customer.0, m.year_month)).collect();
    assert_eq!(months, [(1, 202402), (1, 202403), (2, 202402)]);
  }

  #[test]
  fn product_days_cost_only_when_every_unit_cost_is_known() {
    let facts = [
      fact("S1", at(5, 1), 1, 10, 2, 1000),
      fact("S2", at(5, 1), 2, 10, 1, 1000),
      fact("S3", at(5, 1), 1, 11, 1, 300),
    ];
    let costs = HashMap::from([(SurrogateKey(10), Decimal::new(250, 2))]);
    let built = build_aggregates(&facts, &costs, &AggregateConfig::default()).unwrap();

    let [costed, uncosted] = built.product_daily.as_slice() else {
      panic!("{:?}", built.product_daily)
    };
    assert_eq!(costed.units_sold, 3);
    assert_eq!(costed.revenue, Decimal::new(1800, 2));
    assert_eq!(costed.cost, Some(Decimal::new(750, 2)));
    assert_eq!(costed.profit, Some(Decimal::new(1050, 2)));
    assert_eq!(costed.unique_customers, 2);
    assert_eq!(uncosted.product, SurrogateKey(11));
    assert_eq!((uncosted.cost, uncosted.profit), (None, None));
  }

  #[test]
  fn december_ends_on_the_thirty_first() {
    let (start, end) = month_bounds(202312).unwrap();
    assert_eq!(start, NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
    assert_eq!(end, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    assert!(month_bounds(202313).is_err());
    assert_eq!(end.day(), 31);
  }
}
