//! CSV codec for Strata's input feeds.
//!
//! A *snapshot feed* holds one row per entity of a dimension and becomes
//! [`Snapshot`](strata_core::snapshot::Snapshot)s for the version writer. The
//! *event feed* holds one row per transaction line and becomes
//! [`EventRecord`](strata_core::event::EventRecord)s for the fact binder. The
//! *response feed* holds one campaign response per row and becomes
//! [`ResponseRecord`](strata_core::response::ResponseRecord)s. Column mappings
//! come from a [`FeedProfile`], [`EventProfile`] or [`ResponseProfile`].
//!
//! A malformed row never aborts the file: every reader returns one `Result`
//! per data row, carrying the row's line number on failure.
//!
//! ```no_run
//! use strata_core::dimension::Dimension;
//! use strata_feed::{FeedProfile, load_snapshots};
//!
//! # fn demo(profile: &FeedProfile) -> strata_feed::Result<()> {
//! let rows = load_snapshots(&Dimension::new("customer"), profile)?;
//! let (ok, bad): (Vec<_>, Vec<_>) = rows.into_iter().partition(Result::is_ok);
//! println!("{} snapshots, {} rejected", ok.len(), bad.len());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod profile;
mod read;

pub use error::{Error, Result, RowError, RowFault};
pub use profile::{EventProfile, FeedProfile, MeasureColumns, ResponseProfile, TimestampFormat};
pub use read::{
  Rows, load_events, load_responses, load_snapshots, read_events, read_responses, read_snapshots,
};

#[cfg(test)]
mod tests {
  use std::{collections::BTreeMap, io::Write};

  use chrono::{TimeZone, Utc};
  use rust_decimal::Decimal;
  use strata_core::{
    Error as CoreError,
    binder::{BinderConfig, FactBinder},
    dimension::Dimension,
    memory::MemoryStore,
    response::ResponseKind,
    event::EventRecord,
    retry::RetryConfig,
    run::{CancelFlag, Progress},
    store::FactStore,
  };

  use super::*;

  fn customer_profile(path: std::path::PathBuf) -> FeedProfile {
    FeedProfile {
      path,
      business_key: "customer_id".into(),
      originated_at: Some("registration_date".into()),
      tracked: vec!["city".into(), "customer_segment".into()],
      untracked: vec!["email".into()],
      timestamp_format: TimestampFormat::Auto,
    }
  }

  fn event_profile(path: std::path::PathBuf) -> EventProfile {
    EventProfile {
      path,
      event_id: "transaction_item_id".into(),
      occurred_at: "transaction_date".into(),
      dimensions: BTreeMap::from([
        (Dimension::new("customer"), "customer_id".to_owned()),
        (Dimension::new("product"), "product_id".to_owned()),
        (Dimension::new("campaign"), "campaign_id".to_owned()),
      ]),
      measures: MeasureColumns::default(),
      timestamp_format: TimestampFormat::Auto,
    }
  }

  fn fixture(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
  }

  #[test]
  fn snapshots_map_columns_and_treat_empty_cells_as_absent() {
    let file = fixture(
      "customer_id,registration_date,city,customer_segment,email,ignored\n\
       C-1,2023-01-15,Berlin,Gold,a@example.com,x\n\
       C-2,,Paris,,,y\n",
    );
    let profile = customer_profile(file.path().to_owned());
    let rows = load_snapshots(&Dimension::new("customer"), &profile).unwrap();
    assert_eq!(rows.len(), 2);

    let first = rows[0].as_ref().unwrap();
    assert_eq!(first.business_key, "C-1");
    assert_eq!(first.tracked["customer_segment"], "Gold");
    assert_eq!(first.untracked["email"], "a@example.com");
    assert_eq!(first.originated_at, Some(Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap()));
    assert!(!first.tracked.contains_key("ignored"));

    let second = rows[1].as_ref().unwrap();
    assert_eq!(second.originated_at, None);
    assert!(!second.tracked.contains_key("customer_segment"));
    assert!(second.untracked.is_empty());
  }

  #[test]
  fn bad_rows_are_reported_with_line_numbers_and_do_not_abort() {
    let file = fixture(
      "customer_id,registration_date,city,customer_segment,email\n\
       ,2023-01-15,Berlin,Gold,a@example.com\n\
       C-2,yesterday,Paris,Silver,b@example.com\n\
       C-3,2023-02-01,Rome\n\
       C-4,2023-02-01,Oslo,Bronze,d@example.com\n",
    );
    let profile = customer_profile(file.path().to_owned());
    let rows = load_snapshots(&Dimension::new("customer"), &profile).unwrap();
    assert_eq!(rows.len(), 4);

    let errors: Vec<&RowError> = rows.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.iter().map(|e| e.row).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert!(matches!(errors[0].fault, RowFault::MissingValue { .. }));
    assert!(matches!(errors[1].fault, RowFault::InvalidTimestamp { .. }));
    assert!(matches!(errors[2].fault, RowFault::Csv(_)));
    assert_eq!(rows[3].as_ref().unwrap().business_key, "C-4");
  }

  #[test]
  fn profile_naming_an_absent_column_fails_the_feed() {
    let file = fixture("customer_id,city\nC-1,Berlin\n");
    let profile = customer_profile(file.path().to_owned());
    let err = load_snapshots(&Dimension::new("customer"), &profile).unwrap_err();
    assert!(matches!(err, Error::MissingColumn(c) if c == "registration_date"));
  }

  #[test]
  fn missing_file_is_an_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let profile = customer_profile(dir.path().join("absent.csv"));
    let err = load_snapshots(&Dimension::new("customer"), &profile).unwrap_err();
    assert!(matches!(err, Error::Open { .. }));
  }

  #[test]
  fn events_default_absent_measures_to_zero_and_keep_blank_refs() {
    let file = fixture(
      "transaction_item_id,transaction_date,customer_id,product_id,campaign_id,quantity,unit_price,line_total,discount_amount\n\
       T-1,2024-03-15 10:30:00,C-1,P-9,,2,19.99,39.98,4.00\n\
       T-2,2024-03-16T08:00:00Z,C-2,P-9,CAMP-1,1,5.00,5.00,\n",
    );
    let profile = event_profile(file.path().to_owned());
    let rows = load_events(&profile).unwrap();

    let first = rows[0].as_ref().unwrap();
    assert_eq!(first.event_id, "T-1");
    assert_eq!(first.occurred_at, Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap());
    assert_eq!(first.refs.len(), 3);
    let campaign = first.refs.iter().find(|r| r.dimension == Dimension::new("campaign")).unwrap();
    assert_eq!(campaign.business_key, "");
    assert_eq!(first.measures.quantity, 2);
    assert_eq!(first.measures.gross_amount, Decimal::new(3998, 2));
    assert_eq!(first.measures.discount_amount, Decimal::new(400, 2));
    assert_eq!(first.measures.tax_amount, Decimal::ZERO);
    assert_eq!(first.measures.shipping_amount, Decimal::ZERO);

    let second = rows[1].as_ref().unwrap();
    assert_eq!(second.refs.len(), 3);
    assert_eq!(second.measures.discount_amount, Decimal::ZERO);
  }

  fn rows_ok(rows: &Rows<EventRecord>) -> Vec<EventRecord> {
    rows.iter().filter_map(|r| r.as_ref().ok().cloned()).collect()
  }

  #[tokio::test]
  async fn blank_required_key_is_rejected_by_the_binder() {
    let file = fixture(
      "transaction_item_id,transaction_date,customer_id,quantity,line_total\n\
       T-1,2023-06-01,,1,10.00\n",
    );
    let profile = EventProfile {
      dimensions: BTreeMap::from([(Dimension::new("customer"), "customer_id".to_owned())]),
      ..event_profile(file.path().to_owned())
    };
    let rows = load_events(&profile).unwrap();
    let event = rows[0].as_ref().unwrap();
    assert_eq!(event.refs.len(), 1);

    let store = MemoryStore::new();
    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    let err = binder.bind(event).await.unwrap_err();
    assert!(matches!(err, CoreError::MalformedInput(_)));

    let mut binder = FactBinder::new(&store, BinderConfig::default(), RetryConfig::none());
    let progress = binder.bind_batch(&rows_ok(&rows), &CancelFlag::new()).await.unwrap();
    assert_eq!(progress, Progress::Completed);
    assert_eq!(binder.tally().malformed, 1);
    assert_eq!(binder.tally().bound, 0);
    assert_eq!(store.fact_count().await.unwrap(), 0);
  }

  #[test]
  fn events_reject_bad_measures_per_row() {
    let file = fixture(
      "transaction_item_id,transaction_date,customer_id,product_id,campaign_id,quantity,line_total\n\
       T-1,2024-03-15,C-1,P-1,,two,10.00\n\
       T-2,2024-03-15,C-1,P-1,,1,ten\n\
       T-3,,C-1,P-1,,1,10.00\n\
       T-4,2024-03-15,C-1,P-1,,1,10.00\n",
    );
    let profile = event_profile(file.path().to_owned());
    let rows = read_events(std::fs::File::open(file.path()).unwrap(), &profile).unwrap();

    assert!(matches!(rows[0].as_ref().unwrap_err().fault, RowFault::InvalidQuantity { .. }));
    assert!(matches!(rows[1].as_ref().unwrap_err().fault, RowFault::InvalidDecimal { .. }));
    assert!(matches!(rows[2].as_ref().unwrap_err().fault, RowFault::MissingValue { .. }));
    assert_eq!(rows[3].as_ref().unwrap().measures.gross_amount, Decimal::new(1000, 2));
  }

  fn response_profile(path: std::path::PathBuf) -> ResponseProfile {
    ResponseProfile {
      path,
      response_id: "response_id".into(),
      responded_at: "response_date".into(),
      customer_id: "customer_id".into(),
      campaign_id: "campaign_id".into(),
      response_type: "response_type".into(),
      conversion_value: Some("conversion_value".into()),
      timestamp_format: TimestampFormat::Auto,
    }
  }

  #[test]
  fn responses_parse_kinds_and_default_missing_values() {
    let file = fixture(
      "response_id,campaign_id,customer_id,response_date,response_type,conversion_value\n\
       RESP1,CAMP-1,C-1,2024-03-15,Converted,120.50\n\
       RESP2,CAMP-1,,2024-03-16,opened,\n\
       RESP3,CAMP-1,C-2,2024-03-16,bounced,\n",
    );
    let rows = load_responses(&response_profile(file.path().to_owned())).unwrap();
    assert_eq!(rows.len(), 3);

    let converted = rows[0].as_ref().unwrap();
    assert_eq!(converted.kind, ResponseKind::Converted);
    assert_eq!(converted.conversion_value, Decimal::new(12050, 2));
    assert_eq!(converted.responded_at, Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap());

    let opened = rows[1].as_ref().unwrap();
    assert_eq!(opened.kind, ResponseKind::Opened);
    assert_eq!(opened.customer_key, "");
    assert_eq!(opened.conversion_value, Decimal::ZERO);

    let err = rows[2].as_ref().unwrap_err();
    assert_eq!(err.row, 4);
    assert!(matches!(&err.fault, RowFault::InvalidChoice { value, .. } if value == "bounced"));
  }

  #[test]
  fn response_value_column_is_optional() {
    let file = fixture(
      "response_id,campaign_id,customer_id,response_date,response_type\n\
       RESP1,CAMP-1,C-1,2024-03-15,clicked\n",
    );
    let profile =
      ResponseProfile { conversion_value: None, ..response_profile(file.path().to_owned()) };
    let rows = load_responses(&profile).unwrap();
    assert_eq!(rows[0].as_ref().unwrap().conversion_value, Decimal::ZERO);
  }
}
