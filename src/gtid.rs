//! Transaction-set (GTID set) arithmetic.
//!
//! A set is written as comma separated `source:interval[:interval...]`
//! groups, where each interval is `n` or `a-b` (inclusive), e.g.
//! `3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5:11-18,a1b2:7`. Whitespace and
//! newlines between groups are ignored, as servers wrap long sets.
//!
//! The controller uses this module to rank reboot seeds by progress; errant
//! transaction detection itself is delegated to the server through
//! [`AdminSession::gtid_subtract`](crate::db::AdminSession::gtid_subtract) so
//! the primary stays the authority.

use crate::types::MemberIndex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A transaction set that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed transaction set {input:?}: {reason}")]
pub struct GtidParseError {
    pub input: String,
    pub reason: String,
}

impl GtidParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Normalised transaction set: per source, sorted disjoint inclusive intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Total number of transactions in the set.
    pub fn transaction_count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(|(start, end)| end - start + 1)
            .sum()
    }

    /// Transactions in `self` that are absent from `other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (source, intervals) in &self.sources {
            let remaining = match other.sources.get(source) {
                Some(holes) => subtract_intervals(intervals, holes),
                None => intervals.clone(),
            };
            if !remaining.is_empty() {
                result.sources.insert(source.clone(), remaining);
            }
        }
        result
    }

    /// `self` contains every transaction of `other`.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }

    fn insert(&mut self, source: &str, start: u64, end: u64) {
        let intervals = self.sources.entry(source.to_string()).or_default();
        intervals.push((start, end));
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(s, e) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *intervals = merged;
    }
}

fn subtract_intervals(from: &[(u64, u64)], holes: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    for &(start, end) in from {
        let mut cursor = start;
        for &(hs, he) in holes {
            if he < cursor || hs > end {
                continue;
            }
            if hs > cursor {
                out.push((cursor, hs - 1));
            }
            if he >= end {
                cursor = end.saturating_add(1);
                break;
            }
            cursor = he + 1;
        }
        if cursor <= end {
            out.push((cursor, end));
        }
    }
    out
}

impl FromStr for GtidSet {
    type Err = GtidParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();

        for group in input.split(',') {
            let group: String = group.chars().filter(|c| !c.is_whitespace()).collect();
            if group.is_empty() {
                continue;
            }

            let mut parts = group.split(':');
            let source = match parts.next() {
                Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
                _ => return Err(GtidParseError::new(input, "missing source identifier")),
            };

            let mut saw_interval = false;
            for interval in parts {
                let (start, end) = match interval.split_once('-') {
                    Some((a, b)) => (parse_number(input, a)?, parse_number(input, b)?),
                    None => {
                        let n = parse_number(input, interval)?;
                        (n, n)
                    }
                };
                if start == 0 || end < start {
                    return Err(GtidParseError::new(
                        input,
                        format!("invalid interval {}", interval),
                    ));
                }
                set.insert(&source, start, end);
                saw_interval = true;
            }

            if !saw_interval {
                return Err(GtidParseError::new(
                    input,
                    format!("source {} has no intervals", source),
                ));
            }
        }

        Ok(set)
    }
}

fn parse_number(input: &str, s: &str) -> Result<u64, GtidParseError> {
    s.parse::<u64>()
        .map_err(|_| GtidParseError::new(input, format!("{:?} is not a transaction number", s)))
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(source)?;
            for (start, end) in intervals {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        Ok(())
    }
}

/// Pick the reboot seed: the member with the most executed transactions.
///
/// Ties go to the lowest index. Returns `Ok(None)` when any member's set is
/// unknown, since rebooting from a member that might be behind an
/// unreachable one would discard transactions.
pub fn select_seed(
    gtid_executed: &BTreeMap<MemberIndex, Option<String>>,
) -> Result<Option<MemberIndex>, GtidParseError> {
    let mut best: Option<(MemberIndex, u64)> = None;

    for (&index, gtid) in gtid_executed {
        let Some(gtid) = gtid else {
            return Ok(None);
        };
        let count = gtid.parse::<GtidSet>()?.transaction_count();
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((index, count)),
        }
    }

    Ok(best.map(|(index, _)| index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> GtidSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_count() {
        let s = set("A:1-5:7, b:3");
        assert_eq!(s.transaction_count(), 7);
        assert_eq!(s.to_string(), "a:1-5:7,b:3");
        assert!(set("").is_empty());
    }

    #[test]
    fn test_parse_merges_adjacent_intervals() {
        assert_eq!(set("A:1-3:4-6:8").to_string(), "a:1-6:8");
        assert_eq!(set("A:1-3,A:2-10").to_string(), "a:1-10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("A".parse::<GtidSet>().is_err());
        assert!("A:x-3".parse::<GtidSet>().is_err());
        assert!("A:5-3".parse::<GtidSet>().is_err());
        assert!(":1-3".parse::<GtidSet>().is_err());
    }

    #[test]
    fn test_subtract() {
        let candidate = set("A:1-10,B:1-2");
        let primary = set("A:1-3:5-8");
        assert_eq!(candidate.subtract(&primary).to_string(), "a:4:9-10,b:1-2");
        assert!(primary.subtract(&candidate).is_empty());
        assert!(candidate.contains(&primary));
    }

    #[test]
    fn test_select_seed_most_transactions() {
        let gtids = BTreeMap::from([
            (0, Some("A:1-5".to_string())),
            (1, Some("A:1-7".to_string())),
            (2, Some("A:1-3".to_string())),
        ]);
        assert_eq!(select_seed(&gtids).unwrap(), Some(1));
    }

    #[test]
    fn test_select_seed_tie_prefers_lowest_index() {
        let gtids = BTreeMap::from([
            (0, Some("A:1-4".to_string())),
            (1, Some("B:1-4".to_string())),
        ]);
        assert_eq!(select_seed(&gtids).unwrap(), Some(0));
    }

    #[test]
    fn test_select_seed_requires_every_set() {
        let gtids = BTreeMap::from([(0, Some("A:1-9".to_string())), (1, None)]);
        assert_eq!(select_seed(&gtids).unwrap(), None);
        assert_eq!(select_seed(&BTreeMap::new()).unwrap(), None);
    }
}
