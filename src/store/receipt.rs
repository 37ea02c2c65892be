//! Receipts: the auditable record of one apply attempt.
//!
//! Every apply allocates a [`ReceiptId`] of the form `YYYYMMDD-HHMMSS-NNN`.
//! The trailing counter is per-process and strictly increasing while the
//! wall clock stands still or steps backwards, so two allocations can never
//! collide even under clock stalls. The id doubles as the snapshot key.

use std::{fmt, str::FromStr, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{block::BlockId, errors::MemError};

/// Monotonic identifier for one apply attempt: `YYYYMMDD-HHMMSS-NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptId(String);

impl ReceiptId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReceiptId {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() >= 19
            && s.as_bytes()[8] == b'-'
            && s.as_bytes()[15] == b'-'
            && s.chars().all(|c| c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(MemError::ReceiptNotFound(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

/// Allocates receipt ids, serializing on a small internal state so the
/// `(timestamp, counter)` pair is strictly increasing per process.
#[derive(Debug, Default)]
pub struct ReceiptAllocator {
    state: Mutex<AllocatorState>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    last_stamp: String,
    counter: u32,
}

impl ReceiptAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next receipt id.
    pub fn allocate(&self) -> ReceiptId {
        self.allocate_at(Utc::now())
    }

    fn allocate_at(&self, now: DateTime<Utc>) -> ReceiptId {
        let stamp = now.format("%Y%m%d-%H%M%S").to_string();
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        if stamp > state.last_stamp {
            state.last_stamp = stamp;
            state.counter = 0;
        } else {
            // Identical or stalled clock: the counter alone disambiguates.
            state.counter += 1;
        }
        ReceiptId(format!("{}-{:03}", state.last_stamp, state.counter))
    }
}

/// Outcome of an apply attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptResult {
    Applied,
    RolledBack,
    Rejected,
}

impl fmt::Display for ReceiptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiptResult::Applied => "applied",
            ReceiptResult::RolledBack => "rolled_back",
            ReceiptResult::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ReceiptResult {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(ReceiptResult::Applied),
            "rolled_back" => Ok(ReceiptResult::RolledBack),
            "rejected" => Ok(ReceiptResult::Rejected),
            _ => Err(MemError::CustomError(format!(
                "unknown receipt result `{s}`"
            ))),
        }
    }
}

/// Auditable record of one apply attempt, appended to `intelligence/AUDIT.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    date: DateTime<Utc>,
    proposal_id: Option<BlockId>,
    action: String,
    result: ReceiptResult,
    snapshot_id: ReceiptId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff: Option<String>,
}

impl Receipt {
    pub fn new(
        proposal_id: Option<BlockId>,
        action: impl Into<String>,
        result: ReceiptResult,
        snapshot_id: ReceiptId,
    ) -> Self {
        Self {
            date: Utc::now(),
            proposal_id,
            action: action.into(),
            result,
            snapshot_id,
            diff: None,
        }
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn proposal_id(&self) -> Option<&BlockId> {
        self.proposal_id.as_ref()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn result(&self) -> ReceiptResult {
        self.result
    }

    pub fn snapshot_id(&self) -> &ReceiptId {
        &self.snapshot_id
    }

    pub fn diff(&self) -> Option<&str> {
        self.diff.as_deref()
    }

    pub fn set_diff(&mut self, diff: Option<String>) {
        self.diff = diff;
    }

    /// Audit-trail section appended to `AUDIT.md`.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## Receipt {}\n", self.snapshot_id);
        out.push_str(&format!("Date: {}\n", self.date.format("%Y-%m-%dT%H:%M:%SZ")));
        if let Some(proposal) = &self.proposal_id {
            out.push_str(&format!("Proposal: {}\n", proposal));
        }
        out.push_str(&format!("Action: {}\n", self.action));
        out.push_str(&format!("Result: {}\n", self.result));
        if let Some(diff) = &self.diff {
            out.push_str("\n```diff\n");
            out.push_str(diff);
            if !diff.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_allocation_is_unique_under_stalled_clock() {
        let allocator = ReceiptAllocator::new();
        let frozen = Utc.with_ymd_and_hms(2026, 2, 13, 10, 15, 0).unwrap();

        let a = allocator.allocate_at(frozen);
        let b = allocator.allocate_at(frozen);
        // Clock stepping backwards must still move the counter forward.
        let earlier = Utc.with_ymd_and_hms(2026, 2, 13, 10, 14, 59).unwrap();
        let c = allocator.allocate_at(earlier);

        assert_eq!(a.as_str(), "20260213-101500-000");
        assert_eq!(b.as_str(), "20260213-101500-001");
        assert_eq!(c.as_str(), "20260213-101500-002");
        assert!(a < b && b < c);
    }

    #[test]
    fn test_allocation_advances_with_clock() {
        let allocator = ReceiptAllocator::new();
        let first = Utc.with_ymd_and_hms(2026, 2, 13, 10, 15, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 2, 13, 10, 15, 1).unwrap();

        let a = allocator.allocate_at(first);
        let b = allocator.allocate_at(later);
        assert_eq!(b.as_str(), "20260213-101501-000");
        assert!(a < b);
    }

    #[test]
    fn test_concurrent_allocation_distinct() {
        let allocator = std::sync::Arc::new(ReceiptAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| allocator.allocate()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<ReceiptId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_receipt_markdown() {
        let id: ReceiptId = "20260213-101500-000".parse().unwrap();
        let proposal: BlockId = "P-20260213-001".parse().unwrap();
        let mut receipt = Receipt::new(
            Some(proposal),
            "supersede",
            ReceiptResult::Applied,
            id,
        );
        receipt.set_diff(Some("-old\n+new".to_string()));

        let text = receipt.to_markdown();
        assert!(text.starts_with("## Receipt 20260213-101500-000\n"));
        assert!(text.contains("Proposal: P-20260213-001\n"));
        assert!(text.contains("Result: applied\n"));
        assert!(text.contains("```diff\n-old\n+new\n```\n"));
    }

    #[test]
    fn test_receipt_id_validation() {
        assert!("20260213-101500-000".parse::<ReceiptId>().is_ok());
        assert!("not-a-receipt".parse::<ReceiptId>().is_err());
    }
}
