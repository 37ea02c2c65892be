//! Write-ahead journal for the apply pipeline.
//!
//! The journal lives at `.wal/journal.log`. Each entry is one line:
//!
//! ```text
//! seq \t receipt \t op \t path \t pre_hash \t post_hash
//! ```
//!
//! `begin` entries carry one touched path each with the file's pre- and
//! post-mutation hashes (the apply engine stages new content in memory, so
//! both are known before anything is written). `commit` and `rollback` are
//! single terminator lines with `-` placeholders. Every append is fsynced.
//!
//! On startup [`Wal::replay`] settles any receipt without a terminator: if
//! every touched file already matches its post hash the commit is inferred;
//! otherwise all touched files are restored from the receipt's snapshot so
//! the workspace is byte-identical to the pre-apply state. A journal line
//! that cannot be parsed, or a missing snapshot for a receipt that needs
//! restoring, refuses startup with `WalReplayConflict`.

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::{info, warn};

use super::{receipt::ReceiptId, snapshot::SnapshotStore};
use crate::{
    errors::MemError,
    utils::{ContentHash, atomic_write},
};

/// Journal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for WalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WalOp::Begin => "begin",
            WalOp::Commit => "commit",
            WalOp::Rollback => "rollback",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for WalOp {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(WalOp::Begin),
            "commit" => Ok(WalOp::Commit),
            "rollback" => Ok(WalOp::Rollback),
            _ => Err(MemError::WalReplayConflict(format!("unknown op `{s}`"))),
        }
    }
}

/// One parsed journal line.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub seq: u64,
    pub receipt: ReceiptId,
    pub op: WalOp,
    /// Touched path relative to the workspace root; `None` on terminators.
    pub path: Option<PathBuf>,
    pub pre_hash: Option<ContentHash>,
    pub post_hash: Option<ContentHash>,
}

impl WalRecord {
    fn encode(&self) -> String {
        let field = |p: &Option<String>| p.clone().unwrap_or_else(|| "-".to_string());
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            self.seq,
            self.receipt,
            self.op,
            field(&self.path.as_ref().map(|p| p.display().to_string())),
            field(&self.pre_hash.map(|h| h.to_hex())),
            field(&self.post_hash.map(|h| h.to_hex())),
        )
    }

    fn decode(line: &str) -> Result<Self, MemError> {
        let conflict = |detail: &str| {
            MemError::WalReplayConflict(format!("malformed journal line `{line}`: {detail}"))
        };
        let mut parts = line.split('\t');
        let mut next = |name: &str| parts.next().ok_or_else(|| conflict(name));

        let seq: u64 = next("seq")?
            .parse()
            .map_err(|_| conflict("seq is not an integer"))?;
        let receipt: ReceiptId = next("receipt")?
            .parse()
            .map_err(|_| conflict("bad receipt id"))?;
        let op: WalOp = next("op")?.parse()?;
        let path_raw = next("path")?;
        let pre_raw = next("pre_hash")?;
        let post_raw = next("post_hash")?;

        let optional = |raw: &str| (raw != "-").then(|| raw.to_string());
        let parse_hash = |raw: Option<String>| -> Result<Option<ContentHash>, MemError> {
            raw.map(|h| h.parse()).transpose()
        };

        Ok(Self {
            seq,
            receipt,
            op,
            path: optional(path_raw).map(PathBuf::from),
            pre_hash: parse_hash(optional(pre_raw)).map_err(|_| conflict("bad pre hash"))?,
            post_hash: parse_hash(optional(post_raw)).map_err(|_| conflict("bad post hash"))?,
        })
    }
}

/// How replay settled one unfinalized receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySettlement {
    /// Every touched file already matched its post hash.
    CommitInferred,
    /// Touched files were restored from the snapshot.
    RolledBack,
}

/// Append-only journal handle.
#[derive(Debug)]
pub struct Wal {
    journal: PathBuf,
    next_seq: u64,
}

impl Wal {
    /// Open (or create) the journal at `journal` (`.wal/journal.log`).
    pub fn open(journal: impl Into<PathBuf>) -> Result<Self, MemError> {
        let journal = journal.into();
        let next_seq = match fs::read_to_string(&journal) {
            Ok(text) => text.lines().count() as u64 + 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 1,
            Err(err) => return Err(err.into()),
        };
        Ok(Self { journal, next_seq })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    fn append(&mut self, mut record: WalRecord) -> Result<(), MemError> {
        record.seq = self.next_seq;
        if let Some(parent) = self.journal.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)?;
        file.write_all(record.encode().as_bytes())?;
        file.sync_all()?;
        self.next_seq += 1;
        Ok(())
    }

    /// Journal the intent to mutate `entries` (relative path, pre hash,
    /// post hash), one record per path.
    pub fn begin(
        &mut self,
        receipt: &ReceiptId,
        entries: &[(PathBuf, ContentHash, ContentHash)],
    ) -> Result<(), MemError> {
        for (path, pre_hash, post_hash) in entries {
            self.append(WalRecord {
                seq: 0,
                receipt: receipt.clone(),
                op: WalOp::Begin,
                path: Some(path.clone()),
                pre_hash: Some(*pre_hash),
                post_hash: Some(*post_hash),
            })?;
        }
        Ok(())
    }

    /// Finalize a receipt as committed.
    pub fn commit(&mut self, receipt: &ReceiptId) -> Result<(), MemError> {
        self.terminator(receipt, WalOp::Commit)
    }

    /// Finalize a receipt as rolled back.
    pub fn rollback(&mut self, receipt: &ReceiptId) -> Result<(), MemError> {
        self.terminator(receipt, WalOp::Rollback)
    }

    fn terminator(&mut self, receipt: &ReceiptId, op: WalOp) -> Result<(), MemError> {
        self.append(WalRecord {
            seq: 0,
            receipt: receipt.clone(),
            op,
            path: None,
            pre_hash: None,
            post_hash: None,
        })
    }

    /// Parse every journal line.
    pub fn records(&self) -> Result<Vec<WalRecord>, MemError> {
        let text = match fs::read_to_string(&self.journal) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines().map(WalRecord::decode).collect()
    }

    /// Settle unfinalized receipts, then truncate the journal. Returns the
    /// settlements in journal order so the caller can record rollback
    /// receipts in the audit trail.
    pub fn replay(
        &mut self,
        workspace_root: &Path,
        snapshots: &SnapshotStore,
    ) -> Result<Vec<(ReceiptId, ReplaySettlement)>, MemError> {
        let records = self.records()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut begins: IndexMap<ReceiptId, Vec<WalRecord>> = IndexMap::new();
        let mut finalized: Vec<ReceiptId> = Vec::new();
        for record in records {
            match record.op {
                WalOp::Begin => begins.entry(record.receipt.clone()).or_default().push(record),
                WalOp::Commit | WalOp::Rollback => finalized.push(record.receipt),
            }
        }

        let mut settlements = Vec::new();
        for (receipt, entries) in begins {
            if finalized.contains(&receipt) {
                continue;
            }
            warn!(receipt = %receipt, "unfinalized receipt found in journal");

            let mut all_at_post = true;
            for entry in &entries {
                let path = entry.path.as_ref().ok_or_else(|| {
                    MemError::WalReplayConflict(format!(
                        "begin record without path for receipt {receipt}"
                    ))
                })?;
                let current = ContentHash::of_file(&workspace_root.join(path))?;
                if Some(current) != entry.post_hash {
                    all_at_post = false;
                    break;
                }
            }

            if all_at_post {
                info!(receipt = %receipt, "mutation fully landed, inferring commit");
                settlements.push((receipt, ReplaySettlement::CommitInferred));
            } else {
                snapshots.restore(&receipt, workspace_root).map_err(|err| {
                    MemError::WalReplayConflict(format!(
                        "cannot restore receipt {receipt}: {err}"
                    ))
                })?;
                settlements.push((receipt, ReplaySettlement::RolledBack));
            }
        }

        atomic_write(&self.journal, b"")?;
        self.next_seq = 1;
        Ok(settlements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(n: u32) -> ReceiptId {
        format!("20260213-1015{:02}-000", n).parse().unwrap()
    }

    #[test]
    fn test_record_line_round_trip() {
        let record = WalRecord {
            seq: 7,
            receipt: receipt(0),
            op: WalOp::Begin,
            path: Some(PathBuf::from("decisions/DECISIONS.md")),
            pre_hash: Some(ContentHash::compute(b"before")),
            post_hash: Some(ContentHash::compute(b"after")),
        };
        let line = record.encode();
        let parsed = WalRecord::decode(line.trim_end()).unwrap();
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.op, WalOp::Begin);
        assert_eq!(parsed.path, record.path);
        assert_eq!(parsed.pre_hash, record.pre_hash);

        let terminator = WalRecord {
            seq: 8,
            receipt: receipt(0),
            op: WalOp::Commit,
            path: None,
            pre_hash: None,
            post_hash: None,
        };
        let parsed = WalRecord::decode(terminator.encode().trim_end()).unwrap();
        assert!(parsed.path.is_none());
        assert!(parsed.post_hash.is_none());
    }

    #[test]
    fn test_malformed_line_is_a_conflict() {
        assert!(matches!(
            WalRecord::decode("not a journal line"),
            Err(MemError::WalReplayConflict(_))
        ));
    }

    #[test]
    fn test_committed_receipt_is_not_replayed() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.md"), b"new").unwrap();

        let snapshots = SnapshotStore::new(root.join("snapshots"));
        let mut wal = Wal::open(root.join(".wal/journal.log")).unwrap();
        let id = receipt(1);
        wal.begin(
            &id,
            &[(
                PathBuf::from("a.md"),
                ContentHash::compute(b"old"),
                ContentHash::compute(b"new"),
            )],
        )
        .unwrap();
        wal.commit(&id).unwrap();

        let settlements = wal.replay(root, &snapshots).unwrap();
        assert!(settlements.is_empty());
        assert!(wal.records().unwrap().is_empty());
    }

    #[test]
    fn test_unfinalized_at_post_infers_commit() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.md"), b"new").unwrap();

        let snapshots = SnapshotStore::new(root.join("snapshots"));
        let mut wal = Wal::open(root.join(".wal/journal.log")).unwrap();
        let id = receipt(2);
        wal.begin(
            &id,
            &[(
                PathBuf::from("a.md"),
                ContentHash::compute(b"old"),
                ContentHash::compute(b"new"),
            )],
        )
        .unwrap();

        let settlements = wal.replay(root, &snapshots).unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].1, ReplaySettlement::CommitInferred);
        assert_eq!(fs::read(root.join("a.md")).unwrap(), b"new");
    }

    #[test]
    fn test_unfinalized_partial_mutation_restores_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.md"), b"old-a").unwrap();
        fs::write(root.join("b.md"), b"old-b").unwrap();

        let snapshots = SnapshotStore::new(root.join("snapshots"));
        let id = receipt(3);
        snapshots
            .take(&id, root, &[PathBuf::from("a.md"), PathBuf::from("b.md")])
            .unwrap();

        let mut wal = Wal::open(root.join(".wal/journal.log")).unwrap();
        wal.begin(
            &id,
            &[
                (
                    PathBuf::from("a.md"),
                    ContentHash::compute(b"old-a"),
                    ContentHash::compute(b"new-a"),
                ),
                (
                    PathBuf::from("b.md"),
                    ContentHash::compute(b"old-b"),
                    ContentHash::compute(b"new-b"),
                ),
            ],
        )
        .unwrap();

        // Crash mid-execute: only a.md reached its post state.
        fs::write(root.join("a.md"), b"new-a").unwrap();

        let settlements = wal.replay(root, &snapshots).unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].1, ReplaySettlement::RolledBack);
        assert_eq!(fs::read(root.join("a.md")).unwrap(), b"old-a");
        assert_eq!(fs::read(root.join("b.md")).unwrap(), b"old-b");
    }

    #[test]
    fn test_missing_snapshot_refuses_startup() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.md"), b"half-written").unwrap();

        let snapshots = SnapshotStore::new(root.join("snapshots"));
        let mut wal = Wal::open(root.join(".wal/journal.log")).unwrap();
        let id = receipt(4);
        wal.begin(
            &id,
            &[(
                PathBuf::from("a.md"),
                ContentHash::compute(b"old"),
                ContentHash::compute(b"new"),
            )],
        )
        .unwrap();

        let result = wal.replay(root, &snapshots);
        assert!(matches!(result, Err(MemError::WalReplayConflict(_))));
    }
}
