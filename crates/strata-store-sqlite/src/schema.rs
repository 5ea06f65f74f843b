//! SQL schema for the Strata SQLite store.
//!
//! Executed once at connection startup. Timestamps are fixed-width UTC text
//! (`YYYY-MM-DDTHH:MM:SS.ffffffZ`) so that lexical order equals time order;
//! the open upper bound is stored as the far-future sentinel.

pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Versions are never deleted. AUTOINCREMENT keeps surrogate keys from ever
-- being reused.
CREATE TABLE IF NOT EXISTS dimension_versions (
    surrogate_key  INTEGER PRIMARY KEY AUTOINCREMENT,
    dimension      TEXT NOT NULL,
    business_key   TEXT NOT NULL,
    tracked_json   TEXT NOT NULL,
    untracked_json TEXT NOT NULL,
    valid_from     TEXT NOT NULL,
    valid_to       TEXT NOT NULL,
    is_current     INTEGER NOT NULL CHECK (is_current IN (0, 1)),
    event_count    INTEGER NOT NULL DEFAULT 0,
    total_amount   TEXT NOT NULL DEFAULT '0',
    recorded_at    TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    CHECK (valid_from <= valid_to),
    CHECK (is_current = 0 OR valid_to = '9999-12-31T23:59:59.999999Z')
);

-- At most one current version per business key.
CREATE UNIQUE INDEX IF NOT EXISTS dimension_versions_current_idx
    ON dimension_versions(dimension, business_key) WHERE is_current = 1;

CREATE INDEX IF NOT EXISTS dimension_versions_lookup_idx
    ON dimension_versions(dimension, business_key, valid_from);

-- Decimal measures are stored as text to keep them exact.
CREATE TABLE IF NOT EXISTS facts (
    event_id        TEXT PRIMARY KEY,
    occurred_at     TEXT NOT NULL,
    date_key        INTEGER NOT NULL,
    quantity        INTEGER NOT NULL,
    unit_price      TEXT NOT NULL,
    gross_amount    TEXT NOT NULL,
    discount_amount TEXT NOT NULL,
    tax_amount      TEXT NOT NULL,
    shipping_amount TEXT NOT NULL,
    net_amount      TEXT NOT NULL,
    bound_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fact_keys (
    event_id      TEXT NOT NULL REFERENCES facts(event_id),
    dimension     TEXT NOT NULL,
    surrogate_key INTEGER NOT NULL,
    PRIMARY KEY (event_id, dimension)
);

CREATE INDEX IF NOT EXISTS fact_keys_surrogate_idx
    ON fact_keys(dimension, surrogate_key);

CREATE TABLE IF NOT EXISTS orphans (
    orphan_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL,
    event_id     TEXT NOT NULL,
    dimension    TEXT NOT NULL,
    business_key TEXT NOT NULL,
    occurred_at  TEXT NOT NULL,
    reason       TEXT NOT NULL    -- 'unknown_key' | 'out_of_range'
);

CREATE INDEX IF NOT EXISTS orphans_run_idx ON orphans(run_id);

CREATE TABLE IF NOT EXISTS runs (
    run_id       TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT NOT NULL,
    status       TEXT NOT NULL,
    summary_json TEXT NOT NULL
);

-- Single-row table; a row means some run holds the lock.
CREATE TABLE IF NOT EXISTS run_lock (
    lock_id     INTEGER PRIMARY KEY CHECK (lock_id = 1),
    run_id      TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

-- Bound campaign responses. Keys are surrogate keys.
CREATE TABLE IF NOT EXISTS campaign_responses (
    response_id      TEXT PRIMARY KEY,
    responded_at     TEXT NOT NULL,
    date_key         INTEGER NOT NULL,
    customer_key     INTEGER NOT NULL,
    campaign_key     INTEGER NOT NULL,
    response_type    TEXT NOT NULL,    -- 'opened' | 'clicked' | 'converted'
    is_opened        INTEGER NOT NULL CHECK (is_opened IN (0, 1)),
    is_clicked       INTEGER NOT NULL CHECK (is_clicked IN (0, 1)),
    is_converted     INTEGER NOT NULL CHECK (is_converted IN (0, 1)),
    conversion_value TEXT NOT NULL,
    bound_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS campaign_responses_campaign_idx
    ON campaign_responses(campaign_key, date_key);

-- Aggregates are rebuilt wholesale after every completed run.
CREATE TABLE IF NOT EXISTS agg_customer_monthly (
    customer_key   INTEGER NOT NULL,
    year_month     INTEGER NOT NULL,
    month_start    TEXT NOT NULL,
    month_end      TEXT NOT NULL,
    transactions   INTEGER NOT NULL,
    quantity       INTEGER NOT NULL,
    net_total      TEXT NOT NULL,
    discount_total TEXT NOT NULL,
    average_net    TEXT NOT NULL,
    PRIMARY KEY (customer_key, year_month)
);

CREATE TABLE IF NOT EXISTS agg_product_daily (
    product_key      INTEGER NOT NULL,
    date_key         INTEGER NOT NULL,
    units_sold       INTEGER NOT NULL,
    revenue          TEXT NOT NULL,
    cost             TEXT,             -- NULL when a unit cost was missing
    profit           TEXT,
    unique_customers INTEGER NOT NULL,
    PRIMARY KEY (product_key, date_key)
);

CREATE TABLE IF NOT EXISTS quality_evaluations (
    evaluation_id  TEXT PRIMARY KEY,
    evaluated_at   TEXT NOT NULL,
    overall        REAL NOT NULL,
    total_records  INTEGER NOT NULL,
    failed_records INTEGER NOT NULL,
    passed         INTEGER NOT NULL,
    warning        INTEGER NOT NULL,
    failed         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS quality_evaluations_at_idx
    ON quality_evaluations(evaluated_at);

CREATE TABLE IF NOT EXISTS quality_scores (
    evaluation_id TEXT NOT NULL REFERENCES quality_evaluations(evaluation_id),
    category      TEXT NOT NULL,
    score         REAL NOT NULL,
    PRIMARY KEY (evaluation_id, category)
);

CREATE TABLE IF NOT EXISTS quality_results (
    evaluation_id      TEXT NOT NULL REFERENCES quality_evaluations(evaluation_id),
    position           INTEGER NOT NULL,
    rule               TEXT NOT NULL,
    category           TEXT NOT NULL,
    severity           TEXT NOT NULL,
    total_records      INTEGER NOT NULL,
    failed_records     INTEGER NOT NULL,
    failure_percentage REAL NOT NULL,
    status             TEXT NOT NULL,
    PRIMARY KEY (evaluation_id, position)
);

CREATE TABLE IF NOT EXISTS quality_exceptions (
    evaluation_id TEXT NOT NULL,
    position      INTEGER NOT NULL,
    seq           INTEGER NOT NULL,
    record        TEXT NOT NULL,
    detail        TEXT NOT NULL,
    PRIMARY KEY (evaluation_id, position, seq),
    FOREIGN KEY (evaluation_id, position) REFERENCES quality_results(evaluation_id, position)
);

PRAGMA user_version = 2;
";
