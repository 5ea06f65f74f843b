//! Structural checks over the version history of one business key.
//!
//! A valid history is a gapless, non-overlapping chain of half-open intervals
//! from the first version's `valid_from` to the open sentinel, with exactly one
//! current version holding that open bound.

use std::fmt;

use crate::dimension::{DimensionVersion, SurrogateKey, ValidTo};

/// The first structural defect found in a version history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryViolation {
  NoCurrent,
  MultipleCurrent(Vec<SurrogateKey>),
  /// The current version has a closed upper bound.
  CurrentClosed(SurrogateKey),
  /// A closed (historical) version still has an open upper bound.
  HistoricalOpen(SurrogateKey),
  Inverted(SurrogateKey),
  Gap { before: SurrogateKey, after: SurrogateKey },
  Overlap { first: SurrogateKey, second: SurrogateKey },
}

impl fmt::Display for HistoryViolation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::NoCurrent => f.write_str("no current version"),
      Self::MultipleCurrent(keys) => {
        write!(f, "{} current versions:", keys.len())?;
        for key in keys {
          write!(f, " {key}")?;
        }
        Ok(())
      }
      Self::CurrentClosed(key) => write!(f, "current version {key} has a closed upper bound"),
      Self::HistoricalOpen(key) => write!(f, "historical version {key} is still open"),
      Self::Inverted(key) => write!(f, "version {key} ends before it starts"),
      Self::Gap { before, after } => write!(f, "gap between {before} and {after}"),
      Self::Overlap { first, second } => write!(f, "{first} overlaps {second}"),
    }
  }
}

/// Check one business key's versions. An empty history is valid.
///
/// The slice need not be sorted; versions are ordered by `valid_from`, then
/// by surrogate key, which keeps degenerate same-instant chains in creation
/// order.
pub fn check_history(versions: &[DimensionVersion]) -> Result<(), HistoryViolation> {
  if versions.is_empty() {
    return Ok(());
  }

  let current: Vec<SurrogateKey> = versions
    .iter()
    .filter(|v| v.is_current)
    .map(|v| v.surrogate_key)
    .collect();
  match current.len() {
    0 => return Err(HistoryViolation::NoCurrent),
    1 => {}
    _ => return Err(HistoryViolation::MultipleCurrent(current)),
  }

  let mut ordered: Vec<&DimensionVersion> = versions.iter().collect();
  ordered.sort_by_key(|v| (v.valid_from, v.surrogate_key));

  for v in &ordered {
    if v.validity().is_inverted() {
      return Err(HistoryViolation::Inverted(v.surrogate_key));
    }
    if v.is_current && !v.valid_to.is_open() {
      return Err(HistoryViolation::CurrentClosed(v.surrogate_key));
    }
    if !v.is_current && v.valid_to.is_open() {
      return Err(HistoryViolation::HistoricalOpen(v.surrogate_key));
    }
  }

  for pair in ordered.windows(2) {
    let (prev, next) = (pair[0], pair[1]);
    let expected = ValidTo::At(next.valid_from);
    if prev.valid_to < expected {
      return Err(HistoryViolation::Gap {
        before: prev.surrogate_key,
        after:  next.surrogate_key,
      });
    }
    if prev.valid_to > expected {
      return Err(HistoryViolation::Overlap {
        first:  prev.surrogate_key,
        second: next.surrogate_key,
      });
    }
  }

  // The chain is contiguous, so the last link must be the open current one.
  match ordered.last() {
    Some(last) if last.is_current => Ok(()),
    Some(last) => Err(HistoryViolation::HistoricalOpen(last.surrogate_key)),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use chrono::{DateTime, TimeZone, Utc};

  use super::*;
  use crate::dimension::{BusinessKey, Dimension, EntityMetrics};

  fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
  }

  fn version(sk: i64, from: u32, to: Option<u32>) -> DimensionVersion {
    DimensionVersion {
      surrogate_key: SurrogateKey(sk),
      dimension:     Dimension::new("customer"),
      business_key:  BusinessKey::new("C-1").unwrap(),
      tracked:       Default::default(),
      untracked:     Default::default(),
      valid_from:    ts(from),
      valid_to:      to.map_or(ValidTo::Open, |d| ValidTo::At(ts(d))),
      is_current:    to.is_none(),
      metrics:       EntityMetrics::default(),
      recorded_at:   ts(1),
      updated_at:    ts(1),
    }
  }

  #[test]
  fn contiguous_chain_is_valid() {
    let history = [version(3, 9, None), version(1, 1, Some(4)), version(2, 4, Some(9))];
    assert_eq!(check_history(&history), Ok(()));
  }

  #[test]
  fn degenerate_same_instant_chain_is_valid() {
    let history = [version(1, 1, Some(5)), version(2, 5, Some(5)), version(3, 5, None)];
    assert_eq!(check_history(&history), Ok(()));
  }

  #[test]
  fn detects_gap() {
    let history = [version(1, 1, Some(4)), version(2, 6, None)];
    assert_eq!(
      check_history(&history),
      Err(HistoryViolation::Gap { before: SurrogateKey(1), after: SurrogateKey(2) })
    );
  }

  #[test]
  fn detects_overlap() {
    let history = [version(1, 1, Some(8)), version(2, 6, None)];
    assert_eq!(
      check_history(&history),
      Err(HistoryViolation::Overlap { first: SurrogateKey(1), second: SurrogateKey(2) })
    );
  }

  #[test]
  fn detects_missing_and_duplicate_current() {
    assert_eq!(
      check_history(&[version(1, 1, Some(4))]),
      Err(HistoryViolation::NoCurrent)
    );
    assert!(matches!(
      check_history(&[version(1, 1, None), version(2, 4, None)]),
      Err(HistoryViolation::MultipleCurrent(keys)) if keys.len() == 2
    ));
  }
}
