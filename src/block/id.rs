//! Block identifier grammar and kind enumeration.
//!
//! Every record in a workspace is addressed by a [`BlockId`] of the form
//! `Prefix[-YYYYMMDD]-NNN`. The prefix selects the [`BlockKind`]; the optional
//! date stamps the allocation day; `NNN` is a zero-padded per-day counter.
//! Ids are unique across the whole workspace, and exactly one block declares
//! each id.

use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize, de, ser};

use crate::errors::MemError;

/// Kind of a block, derived from its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockKind {
    /// A formal decision carrying constraint signatures (`D`).
    Decision,
    /// A unit of work, optionally aligned with a decision (`T`).
    Task,
    /// A project entity (`PRJ`).
    Project,
    /// A person entity (`PER`).
    Person,
    /// A tool entity (`TOOL`).
    Tool,
    /// An incident entity (`INC`).
    Incident,
    /// A detected contradiction between two decisions (`C`).
    Contradiction,
    /// A drift reference: informal decision seen in logs (`DREF`).
    DriftRef,
    /// A raw scanner signal (`SIG`).
    Signal,
    /// A staged mutation awaiting apply (`P`).
    Proposal,
    /// A captured insight (`I`).
    Insight,
    /// A recorded blocker (`B`).
    Blocker,
    /// A session log block (`S`).
    Session,
}

/// Prefixes ordered longest-first so that alternation in the id pattern
/// never matches a shorter prefix that is a prefix of a longer one.
const PREFIXES: &[(&str, BlockKind)] = &[
    ("DREF", BlockKind::DriftRef),
    ("TOOL", BlockKind::Tool),
    ("PRJ", BlockKind::Project),
    ("PER", BlockKind::Person),
    ("INC", BlockKind::Incident),
    ("SIG", BlockKind::Signal),
    ("D", BlockKind::Decision),
    ("T", BlockKind::Task),
    ("C", BlockKind::Contradiction),
    ("P", BlockKind::Proposal),
    ("I", BlockKind::Insight),
    ("B", BlockKind::Blocker),
    ("S", BlockKind::Session),
];

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(DREF|TOOL|PRJ|PER|INC|SIG|D|T|C|P|I|B|S)(?:-(\d{8}))?-(\d{3})$")
        .expect("id pattern is valid")
});

impl BlockKind {
    /// The id prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        PREFIXES
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(prefix, _)| *prefix)
            .unwrap_or("D")
    }

    /// Resolve a prefix string to a kind.
    pub fn from_prefix(prefix: &str) -> Result<Self, MemError> {
        PREFIXES
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| MemError::InvalidBlockKind(prefix.to_string()))
    }

    /// Field keys that must be present on a well-formed block of this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            BlockKind::Decision => &["Date", "Status", "Statement"],
            BlockKind::Task => &["Date", "Status", "Title"],
            BlockKind::Project | BlockKind::Person | BlockKind::Tool => &["Name"],
            BlockKind::Incident => &["Date", "Status", "Title"],
            BlockKind::Proposal => &["Date", "Status", "Type", "Target", "Action", "Reason"],
            BlockKind::Contradiction => &["Date", "Left", "Right"],
            BlockKind::DriftRef => &["Date", "Axis"],
            BlockKind::Signal => &["Date", "Summary"],
            BlockKind::Insight | BlockKind::Blocker | BlockKind::Session => &["Date"],
        }
    }

    /// Closed status vocabulary for this kind, or `None` for kinds that
    /// carry no `Status` field.
    pub fn status_values(&self) -> Option<&'static [&'static str]> {
        match self {
            BlockKind::Decision => Some(&["active", "superseded", "archived"]),
            BlockKind::Task => Some(&["open", "in_progress", "done", "blocked", "archived"]),
            BlockKind::Incident => Some(&["open", "resolved", "archived"]),
            BlockKind::Proposal => Some(&[
                "pending", "approved", "applied", "rejected", "deferred", "failed",
            ]),
            _ => None,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Decision => "decision",
            BlockKind::Task => "task",
            BlockKind::Project => "project",
            BlockKind::Person => "person",
            BlockKind::Tool => "tool",
            BlockKind::Incident => "incident",
            BlockKind::Contradiction => "contradiction",
            BlockKind::DriftRef => "drift_ref",
            BlockKind::Signal => "signal",
            BlockKind::Proposal => "proposal",
            BlockKind::Insight => "insight",
            BlockKind::Blocker => "blocker",
            BlockKind::Session => "session",
        };
        write!(f, "{}", name)
    }
}

/// A parsed block identifier: `Prefix[-YYYYMMDD]-NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    kind: BlockKind,
    date: Option<NaiveDate>,
    seq: u32,
}

impl BlockId {
    /// Maximum per-day counter value before [`MemError::CounterExhausted`].
    pub const MAX_SEQ: u32 = 999;

    /// Build an id from parts. `seq` must be within `1..=999`.
    pub fn new(kind: BlockKind, date: Option<NaiveDate>, seq: u32) -> Result<Self, MemError> {
        if seq == 0 || seq > Self::MAX_SEQ {
            return Err(MemError::InvalidBlockId(format!(
                "{}-{:03} (counter out of range)",
                kind.prefix(),
                seq
            )));
        }
        Ok(Self { kind, date, seq })
    }

    /// Allocate the next id for `kind` on `date`, given the highest counter
    /// already used that day. Rolling past 999 within one day is refused.
    pub fn next(kind: BlockKind, date: NaiveDate, last_seq: u32) -> Result<Self, MemError> {
        if last_seq >= Self::MAX_SEQ {
            return Err(MemError::CounterExhausted(
                kind.prefix().to_string(),
                date.format("%Y-%m-%d").to_string(),
            ));
        }
        Self::new(kind, Some(date), last_seq + 1)
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(
                f,
                "{}-{}-{:03}",
                self.kind.prefix(),
                date.format("%Y%m%d"),
                self.seq
            ),
            None => write!(f, "{}-{:03}", self.kind.prefix(), self.seq),
        }
    }
}

impl FromStr for BlockId {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = ID_PATTERN
            .captures(s)
            .ok_or_else(|| MemError::InvalidBlockId(s.to_string()))?;
        let kind = BlockKind::from_prefix(&captures[1])?;
        let date = match captures.get(2) {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw.as_str(), "%Y%m%d")
                    .map_err(|_| MemError::InvalidBlockId(s.to_string()))?,
            ),
            None => None,
        };
        let seq: u32 = captures[3]
            .parse()
            .map_err(|_| MemError::InvalidBlockId(s.to_string()))?;
        if seq == 0 {
            return Err(MemError::InvalidBlockId(s.to_string()));
        }
        Ok(Self { kind, date, seq })
    }
}

impl Serialize for BlockId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        let id: BlockId = "D-20260101-001".parse().unwrap();
        assert_eq!(id.kind(), BlockKind::Decision);
        assert_eq!(id.seq(), 1);
        assert_eq!(id.to_string(), "D-20260101-001");

        let undated: BlockId = "PRJ-004".parse().unwrap();
        assert_eq!(undated.kind(), BlockKind::Project);
        assert!(undated.date().is_none());
        assert_eq!(undated.to_string(), "PRJ-004");
    }

    #[test]
    fn test_long_prefixes_win() {
        let id: BlockId = "DREF-20260301-002".parse().unwrap();
        assert_eq!(id.kind(), BlockKind::DriftRef);

        let tool: BlockId = "TOOL-001".parse().unwrap();
        assert_eq!(tool.kind(), BlockKind::Tool);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!("D-001-extra".parse::<BlockId>().is_err());
        assert!("X-20260101-001".parse::<BlockId>().is_err());
        assert!("D-2026-001".parse::<BlockId>().is_err());
        assert!("D-20260101-1".parse::<BlockId>().is_err());
        assert!("D-20260101-000".parse::<BlockId>().is_err());
        // Calendar-invalid date inside an otherwise well-formed id.
        assert!("D-20261301-001".parse::<BlockId>().is_err());
    }

    #[test]
    fn test_counter_rollover() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let next = BlockId::next(BlockKind::Decision, date, 12).unwrap();
        assert_eq!(next.to_string(), "D-20260213-013");

        let exhausted = BlockId::next(BlockKind::Decision, date, 999);
        assert!(matches!(exhausted, Err(MemError::CounterExhausted(_, _))));
    }

    #[test]
    fn test_kind_vocabulary() {
        assert_eq!(BlockKind::Decision.prefix(), "D");
        assert!(
            BlockKind::Decision
                .status_values()
                .unwrap()
                .contains(&"superseded")
        );
        assert!(BlockKind::Project.status_values().is_none());
        assert!(BlockKind::from_prefix("Q").is_err());
    }
}
