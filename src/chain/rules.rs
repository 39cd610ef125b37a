//! Pure consensus-rule functions: difficulty retarget, timestamp
//! acceptance, and vote tallying (spec.md §4.2).
//!
//! Kept free of any chain-store state so they can be unit tested in
//! isolation; [`super::store::ChainStore`] gathers the ancestor windows
//! these functions need and calls them during block acceptance.

use std::collections::BTreeMap;

/// Initial difficulty, used for genesis and whenever fewer than 2
/// timestamps are available (spec.md §4.2).
pub const DEFAULT_DIFFICULTY: u32 = 128;
pub const TIME_TARGET_SECS: u64 = 30;
pub const CLAMP: f64 = 1.2;
pub const FUTURE_SKEW_SECS: u64 = 120;
pub const DIFFICULTY_WINDOW_TIMESTAMPS: usize = 11;
pub const DIFFICULTY_WINDOW_DIFFICULTIES: usize = 10;
pub const TIMESTAMP_MEDIAN_WINDOW: usize = 6;

/// Difficulty for a block whose parent is `P`, given up to the most recent
/// 11 ancestor timestamps and 10 ancestor difficulties ending at `P`
/// (newest first order is not required; this function sorts).
pub fn retarget_difficulty(
  parent_difficulty: u32,
  recent_timestamps: &[u64],
  recent_difficulties: &[u32],
) -> u32 {
  if recent_timestamps.len() < 2 {
    return DEFAULT_DIFFICULTY;
  }

  let mut timestamps = recent_timestamps.to_vec();
  timestamps.sort_unstable_by(|a, b| b.cmp(a));

  let diffs: Vec<f64> = timestamps
    .windows(2)
    .map(|w| {
      let delta = w[0].saturating_sub(w[1]);
      if delta == 0 {
        1.0
      } else {
        delta as f64
      }
    })
    .collect();
  let avg_freq = diffs.iter().sum::<f64>() / diffs.len() as f64;

  let avg_diff = if recent_difficulties.is_empty() {
    parent_difficulty as f64
  } else {
    recent_difficulties.iter().map(|&d| d as f64).sum::<f64>()
      / recent_difficulties.len() as f64
  };

  let candidate = (avg_diff * TIME_TARGET_SECS as f64 / avg_freq).round();
  let candidate = candidate.clamp(1.0, u32::MAX as f64);

  let lower = (parent_difficulty as f64 / CLAMP).max(1.0);
  let upper = (parent_difficulty as f64 * CLAMP).min(u32::MAX as f64);
  candidate.clamp(lower, upper).round() as u32
}

/// Accepts a block timestamp iff it's at or after the median of the last
/// up-to-6 ancestor timestamps and no more than `FUTURE_SKEW_SECS` ahead of
/// wall-clock `now` (spec.md §4.2).
pub fn timestamp_ok(
  ancestor_timestamps: &[u64],
  timestamp: u64,
  now: u64,
) -> bool {
  if timestamp > now + FUTURE_SKEW_SECS {
    return false;
  }
  if ancestor_timestamps.is_empty() {
    return true;
  }
  let mut window = ancestor_timestamps.to_vec();
  window.sort_unstable();
  timestamp >= median(&window)
}

fn median(sorted: &[u64]) -> u64 {
  let mid = sorted.len() / 2;
  if sorted.len() % 2 == 1 {
    sorted[mid]
  } else {
    (sorted[mid - 1] + sorted[mid]) / 2
  }
}

/// Tallies committed votes (choice strings, in commit order) into a
/// deterministic choice → count map. Missing choices are simply absent,
/// per spec.md §4.2 ("missing choices with count 0 may be omitted").
pub fn tally<'a>(votes: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, u64> {
  let mut results = BTreeMap::new();
  for choice in votes {
    *results.entry(choice.to_string()).or_insert(0) += 1;
  }
  results
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fewer_than_two_timestamps_yields_default() {
    assert_eq!(retarget_difficulty(999, &[1], &[]), DEFAULT_DIFFICULTY);
    assert_eq!(retarget_difficulty(999, &[], &[]), DEFAULT_DIFFICULTY);
  }

  #[test]
  fn retarget_clamps_to_per_step_bound() {
    // wildly fast blocks should push difficulty up, but never beyond
    // parent_difficulty * CLAMP.
    let timestamps: Vec<u64> = (0..11).map(|i| 1_000_000 + i).collect();
    let difficulties = vec![1000u32; 10];
    let d = retarget_difficulty(1000, &timestamps, &difficulties);
    assert!(d as f64 <= 1000.0 * CLAMP + 1.0);
  }

  #[test]
  fn retarget_never_goes_below_one() {
    let timestamps: Vec<u64> = (0..11).map(|i| i * 100_000).collect();
    let difficulties = vec![1u32; 10];
    let d = retarget_difficulty(1, &timestamps, &difficulties);
    assert!(d >= 1);
  }

  #[test]
  fn timestamp_future_skew_rejected() {
    assert!(!timestamp_ok(&[], 1_000_000, 1_000_000 - 121));
    assert!(timestamp_ok(&[], 1_000_000, 1_000_000 - 120));
  }

  #[test]
  fn timestamp_below_median_rejected() {
    let ancestors = vec![100, 200, 300];
    assert!(!timestamp_ok(&ancestors, 150, 10_000));
    assert!(timestamp_ok(&ancestors, 200, 10_000));
  }

  #[test]
  fn tally_counts_by_choice() {
    let results = tally(vec!["A", "A", "B"]);
    assert_eq!(results.get("A"), Some(&2));
    assert_eq!(results.get("B"), Some(&1));
  }
}
