//! Ordered severity levels shared by the notification gate and policy limits.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_PRIORITY_LEVELS: [&str; 4] = ["low", "medium", "high", "critical"];

/// Rank reported for names outside the configured order.
pub const UNKNOWN_PRIORITY_RANK: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriorityOrderError {
    #[error("priority order must declare at least one level")]
    Empty,
    #[error("priority level at index {index} is blank")]
    BlankLevel { index: usize },
    #[error("priority level '{0}' is declared more than once")]
    DuplicateLevel(String),
}

/// A level validated against a [`PriorityOrder`]. Ordering follows rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PriorityLevel {
    rank: usize,
    name: String,
}

impl PriorityLevel {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Ord for PriorityLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

impl PartialOrd for PriorityLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for PriorityLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

/// Level names, lowest first. Rank is the list index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityOrder {
    levels: Vec<String>,
}

impl Default for PriorityOrder {
    fn default() -> Self {
        Self {
            levels: DEFAULT_PRIORITY_LEVELS
                .iter()
                .map(|level| level.to_string())
                .collect(),
        }
    }
}

impl PriorityOrder {
    /// Validates and normalizes (trim + lowercase) the configured levels.
    pub fn new<I, S>(levels: I) -> Result<Self, PriorityOrderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        let mut seen = HashSet::new();
        for (index, level) in levels.into_iter().enumerate() {
            let level = normalize_level_name(level.as_ref());
            if level.is_empty() {
                return Err(PriorityOrderError::BlankLevel { index });
            }
            if !seen.insert(level.clone()) {
                return Err(PriorityOrderError::DuplicateLevel(level));
            }
            normalized.push(level);
        }
        if normalized.is_empty() {
            return Err(PriorityOrderError::Empty);
        }
        Ok(Self { levels: normalized })
    }

    /// Parses a comma-separated list such as `low,medium,high,critical`.
    pub fn from_csv(raw: &str) -> Result<Self, PriorityOrderError> {
        Self::new(raw.split(','))
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn lowest(&self) -> PriorityLevel {
        self.level_at(0)
    }

    pub fn highest(&self) -> PriorityLevel {
        self.level_at(self.levels.len().saturating_sub(1))
    }

    fn level_at(&self, rank: usize) -> PriorityLevel {
        PriorityLevel {
            rank,
            name: self.levels[rank].clone(),
        }
    }

    /// Returns the typed level, or `None` when the name is not configured.
    pub fn parse(&self, raw: &str) -> Option<PriorityLevel> {
        let name = normalize_level_name(raw);
        self.levels
            .iter()
            .position(|level| *level == name)
            .map(|rank| self.level_at(rank))
    }

    /// Rank of `raw`; unknown or empty names rank below every configured level.
    pub fn rank(&self, raw: &str) -> i32 {
        self.parse(raw)
            .and_then(|level| i32::try_from(level.rank).ok())
            .unwrap_or(UNKNOWN_PRIORITY_RANK)
    }

    /// Highest-ranked configured name among `candidates`. Unknown names never win;
    /// `None` when no candidate is configured.
    pub fn max_priority<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<(i32, &'a str)> = None;
        for candidate in candidates {
            let rank = self.rank(candidate);
            if rank == UNKNOWN_PRIORITY_RANK {
                continue;
            }
            if best.map(|(best_rank, _)| rank > best_rank).unwrap_or(true) {
                best = Some((rank, candidate));
            }
        }
        best.map(|(_, name)| name)
    }
}

/// Highest typed level, keeping the first one on ties.
pub fn max_priority_level<'a, I>(levels: I) -> Option<&'a PriorityLevel>
where
    I: IntoIterator<Item = &'a PriorityLevel>,
{
    levels.into_iter().fold(None, |best, level| match best {
        Some(current) if current >= level => Some(current),
        _ => Some(level),
    })
}

fn normalize_level_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{max_priority_level, PriorityOrder, PriorityOrderError, UNKNOWN_PRIORITY_RANK};

    #[test]
    fn unit_default_order_ranks_four_levels_lowest_first() {
        let order = PriorityOrder::default();
        assert_eq!(order.rank("low"), 0);
        assert_eq!(order.rank("medium"), 1);
        assert_eq!(order.rank("HIGH"), 2);
        assert_eq!(order.rank(" critical "), 3);
        assert_eq!(order.lowest().name(), "low");
        assert_eq!(order.highest().name(), "critical");
    }

    #[test]
    fn unit_unknown_and_empty_levels_rank_below_everything() {
        let order = PriorityOrder::default();
        assert_eq!(order.rank("urgent"), UNKNOWN_PRIORITY_RANK);
        assert_eq!(order.rank(""), UNKNOWN_PRIORITY_RANK);
        assert!(order.rank("urgent") < order.rank("low"));
        assert!(order.parse("urgent").is_none());
    }

    #[test]
    fn functional_max_priority_ignores_unknown_levels() {
        let order = PriorityOrder::default();
        assert_eq!(order.max_priority(["low", "high", "medium"]), Some("high"));
        assert_eq!(order.max_priority(["bogus", "low"]), Some("low"));
        assert_eq!(order.max_priority(["bogus", ""]), None);
        assert_eq!(order.max_priority(std::iter::empty::<&str>()), None);
    }

    #[test]
    fn functional_typed_levels_compare_by_rank() {
        let order = PriorityOrder::from_csv("info, warn, page").expect("order");
        let info = order.parse("info").expect("info");
        let page = order.parse("PAGE").expect("page");
        assert!(page > info);
        let levels = [info.clone(), page.clone(), info];
        assert_eq!(max_priority_level(levels.iter()), Some(&page));
    }

    #[test]
    fn regression_order_validation_rejects_blank_and_duplicate_levels() {
        assert_eq!(
            PriorityOrder::new(Vec::<String>::new()),
            Err(PriorityOrderError::Empty)
        );
        assert_eq!(
            PriorityOrder::from_csv("low,,high"),
            Err(PriorityOrderError::BlankLevel { index: 1 })
        );
        assert_eq!(
            PriorityOrder::from_csv("low,High,high"),
            Err(PriorityOrderError::DuplicateLevel("high".to_string()))
        );
    }
}
