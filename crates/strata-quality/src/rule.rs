//! Rule definitions and the TOML rule catalog.
//!
//! Every rule is one of a closed set of typed kinds ([`RuleKind`]); there is
//! no free-form query language. A catalog file looks like:
//!
//! ```toml
//! [[rules]]
//! name              = "Customer Email Not Null"
//! category          = "completeness"
//! severity          = "warning"
//! failure_threshold = 5.0
//! kind              = "not_null"
//! dimension         = "customer"
//! attribute         = "email"
//! ```

use std::{collections::HashSet, path::Path, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strata_core::{dimension::Dimension, event::FactRecord};
use strum::{Display, EnumIter, EnumString};

use crate::{Error, Result};

// ─── Classification ──────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
  Completeness,
  Accuracy,
  Consistency,
  Validity,
  Uniqueness,
  Timeliness,
  Integrity,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
  Critical,
  Warning,
  Info,
}

// ─── Targets ─────────────────────────────────────────────────────────────────

/// A numeric measure of a bound fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Measure {
  Quantity,
  UnitPrice,
  GrossAmount,
  DiscountAmount,
  TaxAmount,
  ShippingAmount,
  NetAmount,
}

impl Measure {
  pub fn of(self, fact: &FactRecord) -> Decimal {
    let m = &fact.measures;
    match self {
      Self::Quantity => Decimal::from(m.quantity),
      Self::UnitPrice => m.unit_price,
      Self::GrossAmount => m.gross_amount,
      Self::DiscountAmount => m.discount_amount,
      Self::TaxAmount => m.tax_amount,
      Self::ShippingAmount => m.shipping_amount,
      Self::NetAmount => fact.net_amount,
    }
  }
}

/// What a value-level rule inspects: an attribute of the current versions of
/// a dimension, or a measure of every fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
  Attribute { dimension: Dimension, attribute: String },
  Measure { measure: Measure },
}

// ─── Comparisons ─────────────────────────────────────────────────────────────

/// A constant compared for equality: numbers compare numerically, anything
/// else as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
  Number(Decimal),
  Text(String),
}

/// A value taken from an attribute or a measure.
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
  Text(&'a str),
  Number(Decimal),
}

impl Observed<'_> {
  fn number(&self) -> Option<Decimal> {
    match self {
      Self::Text(s) => Decimal::from_str(s.trim()).ok(),
      Self::Number(d) => Some(*d),
    }
  }

  fn text(&self) -> String {
    match self {
      Self::Text(s) => (*s).to_owned(),
      Self::Number(d) => d.normalize().to_string(),
    }
  }
}

/// The assertion of a [`RuleKind::Predicate`] rule. A record fails when the
/// comparison does not hold; a non-numeric value never satisfies an ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Comparison {
  Eq(Scalar),
  Ne(Scalar),
  Lt(Decimal),
  Le(Decimal),
  Gt(Decimal),
  Ge(Decimal),
  OneOf(Vec<String>),
  StartsWith(String),
}

impl Comparison {
  pub fn holds(&self, value: Observed<'_>) -> bool {
    let ordered = |f: fn(&Decimal, &Decimal) -> bool, bound: &Decimal| {
      value.number().is_some_and(|v| f(&v, bound))
    };
    match self {
      Self::Eq(expected) => scalar_eq(expected, value),
      Self::Ne(expected) => !scalar_eq(expected, value),
      Self::Lt(bound) => ordered(Decimal::lt, bound),
      Self::Le(bound) => ordered(Decimal::le, bound),
      Self::Gt(bound) => ordered(Decimal::gt, bound),
      Self::Ge(bound) => ordered(Decimal::ge, bound),
      Self::OneOf(allowed) => {
        let text = value.text();
        allowed.iter().any(|a| *a == text)
      }
      Self::StartsWith(prefix) => value.text().starts_with(prefix.as_str()),
    }
  }
}

fn scalar_eq(expected: &Scalar, value: Observed<'_>) -> bool {
  match expected {
    Scalar::Number(n) => value.number() == Some(*n),
    Scalar::Text(t) => value.text() == *t,
  }
}

// ─── Rules ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
  /// The attribute is present and non-empty on every current version.
  NotNull { dimension: Dimension, attribute: String },
  /// The value parses as a decimal within `[min, max]`. Versions lacking the
  /// attribute are not counted.
  Range {
    target: Target,
    #[serde(default)]
    min:    Option<Decimal>,
    #[serde(default)]
    max:    Option<Decimal>,
  },
  /// Every surrogate key a fact holds for `dimension` names a stored version.
  Referential { dimension: Dimension },
  Predicate { target: Target, check: Comparison },
  /// Each business key's history is gapless, non-overlapping, and has exactly
  /// one current version.
  TemporalIntegrity { dimension: Dimension },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
  pub name:              String,
  #[serde(default)]
  pub description:       String,
  pub category:          Category,
  pub severity:          Severity,
  /// Percentage of failing records (0-100) tolerated as a warning.
  #[serde(default)]
  pub failure_threshold: f64,
  #[serde(flatten)]
  pub kind:              RuleKind,
}

impl Rule {
  fn validate(&self) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidRule {
      name:   self.name.clone(),
      reason: reason.to_owned(),
    };
    if self.name.trim().is_empty() {
      return Err(invalid("name is empty"));
    }
    if !(0.0..=100.0).contains(&self.failure_threshold) {
      return Err(invalid("failure_threshold must be between 0 and 100"));
    }
    match &self.kind {
      RuleKind::Range { min: None, max: None, .. } => Err(invalid("range needs min or max")),
      RuleKind::Range { min: Some(min), max: Some(max), .. } if min > max => {
        Err(invalid("range min exceeds max"))
      }
      RuleKind::Predicate { check: Comparison::OneOf(allowed), .. } if allowed.is_empty() => {
        Err(invalid("one_of needs at least one value"))
      }
      _ => Ok(()),
    }
  }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// An ordered, validated set of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
  #[serde(default)]
  pub rules: Vec<Rule>,
}

impl Catalog {
  pub fn from_toml_str(input: &str) -> Result<Self> {
    let catalog: Self = toml::from_str(input)?;
    catalog.validate()?;
    Ok(catalog)
  }

  pub fn load(path: &Path) -> Result<Self> {
    let input = std::fs::read_to_string(path)
      .map_err(|source| Error::Read { path: path.to_owned(), source })?;
    Self::from_toml_str(&input)
  }

  fn validate(&self) -> Result<()> {
    let mut names = HashSet::new();
    for rule in &self.rules {
      rule.validate()?;
      if !names.insert(rule.name.as_str()) {
        return Err(Error::InvalidRule {
          name:   rule.name.clone(),
          reason: "duplicate rule name".into(),
        });
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CATALOG: &str = r#"
    [[rules]]
    name              = "Customer Email Not Null"
    category          = "completeness"
    severity          = "warning"
    failure_threshold = 5.0
    kind              = "not_null"
    dimension         = "customer"
    attribute         = "email"

    [[rules]]
    name     = "Unit Price Positive"
    category = "accuracy"
    severity = "critical"
    kind     = "range"
    target   = { measure = "unit_price" }
    min      = 0.01

    [[rules]]
    name     = "Known Segment"
    category = "validity"
    severity = "info"
    kind     = "predicate"
    target   = { dimension = "customer", attribute = "customer_segment" }
    check    = { op = "one_of", value = ["Gold", "Silver", "Bronze"] }

    [[rules]]
    name     = "Customer History"
    category = "integrity"
    severity = "critical"
    kind     = "temporal_integrity"
    dimension = "customer"
  "#;

  #[test]
  fn parses_every_kind_shape() {
    let catalog = Catalog::from_toml_str(CATALOG).unwrap();
    assert_eq!(catalog.rules.len(), 4);
    assert_eq!(catalog.rules[0].kind, RuleKind::NotNull {
      dimension: Dimension::new("customer"),
      attribute: "email".into(),
    });
    assert!(matches!(
      &catalog.rules[1].kind,
      RuleKind::Range { target: Target::Measure { measure: Measure::UnitPrice }, min: Some(_), max: None }
    ));
    assert!(matches!(
      &catalog.rules[2].kind,
      RuleKind::Predicate { target: Target::Attribute { .. }, check: Comparison::OneOf(v) } if v.len() == 3
    ));
    assert_eq!(catalog.rules[3].severity, Severity::Critical);
    assert_eq!(catalog.rules[1].failure_threshold, 0.0);
  }

  #[test]
  fn rejects_invalid_rules() {
    let empty_range = r#"
      [[rules]]
      name = "r"
      category = "accuracy"
      severity = "info"
      kind = "range"
      target = { measure = "quantity" }
    "#;
    assert!(matches!(Catalog::from_toml_str(empty_range), Err(Error::InvalidRule { .. })));

    let rule = r#"
      [[rules]]
      name = "Customer History"
      category = "integrity"
      severity = "critical"
      kind = "temporal_integrity"
      dimension = "customer"
    "#;
    let duplicate = format!("{CATALOG}{rule}");
    assert!(matches!(Catalog::from_toml_str(&duplicate), Err(Error::InvalidRule { .. })));

    let unknown_kind = r#"
      [[rules]]
      name = "r"
      category = "accuracy"
      severity = "info"
      kind = "custom_sql"
    "#;
    assert!(matches!(Catalog::from_toml_str(unknown_kind), Err(Error::Toml(_))));
  }

  #[test]
  fn comparisons_are_typed() {
    let gold = Observed::Text("Gold");
    assert!(Comparison::Eq(Scalar::Text("Gold".into())).holds(gold));
    assert!(Comparison::StartsWith("Go".into()).holds(gold));
    assert!(!Comparison::Ge(Decimal::ZERO).holds(gold));

    let price = Observed::Number(Decimal::new(1050, 2));
    assert!(Comparison::Eq(Scalar::Number(Decimal::new(105, 1))).holds(price));
    assert!(Comparison::Gt(Decimal::TEN).holds(price));
    assert!(!Comparison::Le(Decimal::TEN).holds(price));
    assert!(Comparison::OneOf(vec!["10.5".into()]).holds(price));
    assert!(Comparison::Ne(Scalar::Text("x".into())).holds(price));
  }
}
