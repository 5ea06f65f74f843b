//! [`ResponseStore`] and [`AggregateStore`] for [`SqliteStore`]: the campaign
//! response facts and the two aggregate tables rebuilt after each run.

use rusqlite::TransactionBehavior;

use strata_core::{
  aggregate::{Aggregates, CustomerMonth, ProductDay},
  dimension::SurrogateKey,
  response::ResponseFact,
  store::{AggregateStore, ResponseStore},
};

use crate::{
  Result, SqliteStore,
  encode::{
    decode_date, decode_decimal, decode_dt, decode_label, decode_opt_decimal, encode_date,
    encode_decimal, encode_dt,
  },
};

// ─── Raw rows ────────────────────────────────────────────────────────────────

struct RawResponse {
  response_id:      String,
  responded_at:     String,
  date_key:         u32,
  customer_key:     i64,
  campaign_key:     i64,
  response_type:    String,
  conversion_value: String,
  bound_at:         String,
}

impl RawResponse {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      response_id:      row.get(0)?,
      responded_at:     row.get(1)?,
      date_key:         row.get(2)?,
      customer_key:     row.get(3)?,
      campaign_key:     row.get(4)?,
      response_type:    row.get(5)?,
      conversion_value: row.get(6)?,
      bound_at:         row.get(7)?,
    })
  }

  fn into_response(self) -> Result<ResponseFact> {
    Ok(ResponseFact {
      response_id:      self.response_id,
      responded_at:     decode_dt(&self.responded_at)?,
      date_key:         self.date_key,
      customer:         SurrogateKey(self.customer_key),
      campaign:         SurrogateKey(self.campaign_key),
      kind:             decode_label(&self.response_type, "response type")?,
      conversion_value: decode_decimal(&self.conversion_value)?,
      bound_at:         decode_dt(&self.bound_at)?,
    })
  }
}

struct RawMonth {
  customer_key:   i64,
  year_month:     u32,
  month_start:    String,
  month_end:      String,
  transactions:   i64,
  quantity:       i64,
  net_total:      String,
  discount_total: String,
  average_net:    String,
}

impl RawMonth {
  fn into_month(self) -> Result<CustomerMonth> {
    Ok(CustomerMonth {
      customer:       SurrogateKey(self.customer_key),
      year_month:     self.year_month,
      month_start:    decode_date(&self.month_start)?,
      month_end:      decode_date(&self.month_end)?,
      transactions:   u64::try_from(self.transactions).unwrap_or_default(),
      quantity:       self.quantity,
      net_total:      decode_decimal(&self.net_total)?,
      discount_total: decode_decimal(&self.discount_total)?,
      average_net:    decode_decimal(&self.average_net)?,
    })
  }
}

struct RawDay {
  product_key:      i64,
  date_key:         u32,
  units_sold:       i64,
  revenue:          String,
  cost:             Option<String>,
  profit:           Option<String>,
  unique_customers: i64,
}

impl RawDay {
  fn into_day(self) -> Result<ProductDay> {
    Ok(ProductDay {
      product:          SurrogateKey(self.product_key),
      date_key:         self.date_key,
      units_sold:       self.units_sold,
      revenue:          decode_decimal(&self.revenue)?,
      cost:             decode_opt_decimal(self.cost.as_deref())?,
      profit:           decode_opt_decimal(self.profit.as_deref())?,
      unique_customers: u64::try_from(self.unique_customers).unwrap_or_default(),
    })
  }
}

// ─── ResponseStore impl ──────────────────────────────────────────────────────

impl ResponseStore for SqliteStore {
  async fn contains_response(&self, response_id: &str) -> Result<bool> {
    let id = response_id.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT EXISTS (SELECT 1 FROM campaign_responses WHERE response_id = ?1)",
          rusqlite::params![id],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(exists)
  }

  async fn insert_response(&self, response: &ResponseFact) -> Result<bool> {
    let id = response.response_id.clone();
    let responded_at = encode_dt(response.responded_at);
    let date_key = response.date_key;
    let (customer, campaign) = (response.customer.0, response.campaign.0);
    let kind = response.kind.to_string();
    let flags = [response.is_opened(), response.is_clicked(), response.is_converted()];
    let value = encode_decimal(response.conversion_value);
    let bound_at = encode_dt(response.bound_at);

    let changed = self
      .conn
      .call(move |conn| {
        let [opened, clicked, converted] = flags;
        Ok(conn.execute(
          "INSERT OR IGNORE INTO campaign_responses (
             response_id, responded_at, date_key, customer_key, campaign_key, response_type,
             is_opened, is_clicked, is_converted, conversion_value, bound_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
          rusqlite::params![
            id,
            responded_at,
            date_key,
            customer,
            campaign,
            kind,
            opened,
            clicked,
            converted,
            value,
            bound_at,
          ],
        )?)
      })
      .await?;
    Ok(changed > 0)
  }

  async fn responses(&self) -> Result<Vec<ResponseFact>> {
    let raws = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT response_id, responded_at, date_key, customer_key, campaign_key,
                  response_type, conversion_value, bound_at
           FROM campaign_responses ORDER BY response_id",
        )?;
        let rows = stmt
          .query_map([], RawResponse::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawResponse::into_response).collect()
  }
}

// ─── AggregateStore impl ─────────────────────────────────────────────────────

impl AggregateStore for SqliteStore {
  async fn replace_aggregates(&self, aggregates: &Aggregates) -> Result<()> {
    let months: Vec<(i64, u32, String, String, i64, i64, [String; 3])> = aggregates
      .customer_monthly
      .iter()
      .map(|m| {
        (
          m.customer.0,
          m.year_month,
          encode_date(m.month_start),
          encode_date(m.month_end),
          i64::try_from(m.transactions).unwrap_or(i64::MAX),
          m.quantity,
          [
            encode_decimal(m.net_total),
            encode_decimal(m.discount_total),
            encode_decimal(m.average_net),
          ],
        )
      })
      .collect();
    let days: Vec<(i64, u32, i64, String, Option<String>, Option<String>, i64)> = aggregates
      .product_daily
      .iter()
      .map(|d| {
        (
          d.product.0,
          d.date_key,
          d.units_sold,
          encode_decimal(d.revenue),
          d.cost.map(encode_decimal),
          d.profit.map(encode_decimal),
          i64::try_from(d.unique_customers).unwrap_or(i64::MAX),
        )
      })
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM agg_customer_monthly", [])?;
        tx.execute("DELETE FROM agg_product_daily", [])?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO agg_customer_monthly (
               customer_key, year_month, month_start, month_end, transactions, quantity,
               net_total, discount_total, average_net
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          )?;
          for (sk, year_month, start, end, transactions, quantity, [net, discount, average]) in
            &months
          {
            stmt.execute(rusqlite::params![
              sk,
              year_month,
              start,
              end,
              transactions,
              quantity,
              net,
              discount,
              average
            ])?;
          }

          let mut stmt = tx.prepare(
            "INSERT INTO agg_product_daily (
               product_key, date_key, units_sold, revenue, cost, profit, unique_customers
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          )?;
          for (sk, date_key, units, revenue, cost, profit, customers) in &days {
            stmt.execute(rusqlite::params![sk, date_key, units, revenue, cost, profit, customers])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn customer_monthly(&self) -> Result<Vec<CustomerMonth>> {
    let raws = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT customer_key, year_month, month_start, month_end, transactions, quantity,
                  net_total, discount_total, average_net
           FROM agg_customer_monthly ORDER BY customer_key, year_month",
        )?;
        let rows = stmt
          .query_map([], |r| {
            Ok(RawMonth {
              customer_key:   r.get(0)?,
              year_month:     r.get(1)?,
              month_start:    r.get(2)?,
              month_end:      r.get(3)?,
              transactions:   r.get(4)?,
              quantity:       r.get(5)?,
              net_total:      r.get(6)?,
              discount_total: r.get(7)?,
              average_net:    r.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawMonth::into_month).collect()
  }

  async fn product_daily(&self) -> Result<Vec<ProductDay>> {
    let raws = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT product_key, date_key, units_sold, revenue, cost, profit, unique_customers
           FROM agg_product_daily ORDER BY product_key, date_key",
        )?;
        let rows = stmt
          .query_map([], |r| {
            Ok(RawDay {
              product_key:      r.get(0)?,
              date_key:         r.get(1)?,
              units_sold:       r.get(2)?,
              revenue:          r.get(3)?,
              cost:             r.get(4)?,
              profit:           r.get(5)?,
              unique_customers: r.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawDay::into_day).collect()
  }
}
