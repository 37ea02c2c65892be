//! Workspace context: canonical layout, open/close lifecycle, and shared IO.
//!
//! A [`Workspace`] is the per-workspace context value threaded through the
//! public API. Opening a workspace runs schema migration, loads config and
//! ACL, and replays the WAL so a crash between `begin` and `commit` is
//! settled before anything else observes the tree. All non-append writes go
//! through replace-on-rename; daily logs only ever grow.
//!
//! Canonical layout under the root:
//!
//! ```text
//! mem-os.json                          config
//! mem-os-acl.json                      acl
//! decisions/DECISIONS.md               decisions
//! tasks/TASKS.md                       tasks
//! entities/{projects,people,tools,incidents}.md
//! memory/YYYY-MM-DD.md                 daily logs (append-only)
//! memory/intel-state.json              scanner state
//! intelligence/*.md                    scan reports + audit trail
//! intelligence/proposed/*_PROPOSED.md  staged proposals
//! intelligence/state/snapshots/<id>/   snapshots
//! .wal/journal.log                     write-ahead journal
//! agents/<id>/...                      per-agent namespaces
//! ```

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{NaiveDate, Utc};
use fs2::FileExt;
use path_absolutize::Absolutize;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    acl::AclPolicy,
    block::{Block, ParseDiagnostic, parser},
    config::{MemOsConfig, ensure_schema_version},
    errors::MemError,
    governance::mode::{CleanEvidence, GovernanceMode, check_transition},
    lock::{self, LockGuard},
    store::{Receipt, ReceiptAllocator, ReceiptId, ReceiptResult, SnapshotStore, Wal},
    utils::{ContentHash, atomic_write, check_append_only},
};

/// Per-workspace context. Construct with [`Workspace::open`] or
/// [`Workspace::init`]; everything else hangs off it.
pub struct Workspace {
    root: PathBuf,
    config: MemOsConfig,
    acl: AclPolicy,
    receipts: ReceiptAllocator,
    pub(crate) recall_cache: Mutex<Option<crate::recall::index::CachedIndex>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("mode", &self.config.governance_mode)
            .finish()
    }
}

impl Workspace {
    /// Create the canonical skeleton at `root` and open it.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, MemError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        for dir in [
            "decisions",
            "tasks",
            "entities",
            "memory",
            "intelligence/proposed",
            "intelligence/state/snapshots",
            ".wal",
            "agents",
        ] {
            fs::create_dir_all(root.join(dir))?;
        }
        for (file, title) in [
            ("decisions/DECISIONS.md", "# Decisions\n"),
            ("tasks/TASKS.md", "# Tasks\n"),
            ("entities/projects.md", "# Projects\n"),
            ("entities/people.md", "# People\n"),
            ("entities/tools.md", "# Tools\n"),
            ("entities/incidents.md", "# Incidents\n"),
            ("intelligence/AUDIT.md", "# Audit\n"),
        ] {
            let path = root.join(file);
            if !path.exists() {
                atomic_write(&path, title.as_bytes())?;
            }
        }
        Self::open(root)
    }

    /// Open an existing workspace: migrate schema, load config and ACL, and
    /// replay the WAL.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MemError> {
        let root: PathBuf = root.into();
        if !root.is_dir() {
            return Err(MemError::CustomError(format!(
                "workspace root `{}` is not a directory",
                root.display()
            )));
        }
        let root = fs::canonicalize(&root)?;

        ensure_schema_version(&root)?;
        let config = MemOsConfig::load(&root.join("mem-os.json"))?;
        let acl = AclPolicy::load(&root.join("mem-os-acl.json"))?;

        let workspace = Self {
            root,
            config,
            acl,
            receipts: ReceiptAllocator::new(),
            recall_cache: Mutex::new(None),
        };
        workspace.replay_wal()?;
        Ok(workspace)
    }

    fn replay_wal(&self) -> Result<(), MemError> {
        let mut wal = Wal::open(self.wal_path())?;
        let snapshots = self.snapshot_store();
        let settlements = wal.replay(&self.root, &snapshots)?;
        for (receipt_id, settlement) in settlements {
            let result = match settlement {
                crate::store::wal::ReplaySettlement::CommitInferred => ReceiptResult::Applied,
                crate::store::wal::ReplaySettlement::RolledBack => ReceiptResult::RolledBack,
            };
            info!(receipt = %receipt_id, ?result, "settled unfinalized receipt at startup");
            let receipt = Receipt::new(None, "wal_replay", result, receipt_id);
            self.append_audit(&receipt)?;
        }
        Ok(())
    }

    // --- layout -----------------------------------------------------------

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MemOsConfig {
        &self.config
    }

    pub fn acl(&self) -> &AclPolicy {
        &self.acl
    }

    pub fn mode(&self) -> GovernanceMode {
        self.config.governance_mode
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("mem-os.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".mem-os.lock")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join(".wal/journal.log")
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.root.join("intelligence/state/snapshots"))
    }

    pub fn decisions_path(&self) -> PathBuf {
        self.root.join("decisions/DECISIONS.md")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.root.join("tasks/TASKS.md")
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.root.join("entities")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn daily_log_path(&self, date: NaiveDate) -> PathBuf {
        self.memory_dir()
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn intel_state_path(&self) -> PathBuf {
        self.memory_dir().join("intel-state.json")
    }

    pub fn intelligence_dir(&self) -> PathBuf {
        self.root.join("intelligence")
    }

    pub fn proposed_dir(&self) -> PathBuf {
        self.intelligence_dir().join("proposed")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.intelligence_dir().join("AUDIT.md")
    }

    pub fn signals_path(&self) -> PathBuf {
        self.intelligence_dir().join("SIGNALS.md")
    }

    pub fn contradictions_path(&self) -> PathBuf {
        self.intelligence_dir().join("CONTRADICTIONS.md")
    }

    pub fn drift_path(&self) -> PathBuf {
        self.intelligence_dir().join("DRIFT.md")
    }

    pub fn impact_path(&self) -> PathBuf {
        self.intelligence_dir().join("IMPACT.md")
    }

    pub fn scan_log_path(&self) -> PathBuf {
        self.intelligence_dir().join("SCAN_LOG.md")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    // --- mode -------------------------------------------------------------

    /// Explicit operator transition. Downgrades are unconditional; upgrades
    /// require the documented clean evidence. Persists the config.
    pub fn set_mode(
        &mut self,
        to: GovernanceMode,
        evidence: CleanEvidence,
    ) -> Result<(), MemError> {
        check_transition(self.config.governance_mode, to, evidence)?;
        info!(from = %self.config.governance_mode, to = %to, "governance mode transition");
        self.config.governance_mode = to;
        self.config.save(&self.config_path())
    }

    // --- locking ----------------------------------------------------------

    /// Take the workspace writer lock (30 s hard timeout).
    pub fn lock(&self) -> Result<LockGuard, MemError> {
        lock::acquire(&self.lock_path(), lock::DEFAULT_TIMEOUT)
    }

    /// Take the workspace writer lock with an explicit timeout.
    pub fn lock_with_timeout(&self, timeout: Duration) -> Result<LockGuard, MemError> {
        lock::acquire(&self.lock_path(), timeout)
    }

    // --- path containment -------------------------------------------------

    /// Resolve a workspace-relative path via canonical real-path and assert
    /// containment under the root. The deepest existing ancestor is
    /// symlink-collapsed so traversal through links is caught even for
    /// files the mutation is about to create.
    pub fn contain(&self, relative: &Path) -> Result<PathBuf, MemError> {
        if relative.is_absolute() {
            return Err(MemError::PathTraversal(relative.to_path_buf()));
        }
        let joined = self.root.join(relative);
        let absolute = joined
            .absolutize()
            .map_err(MemError::IOError)?
            .to_path_buf();

        // Canonicalize the deepest existing ancestor, then re-attach the
        // not-yet-existing remainder.
        let mut existing = absolute.clone();
        let mut remainder = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    remainder.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return Err(MemError::PathTraversal(relative.to_path_buf())),
            }
        }
        let mut resolved = fs::canonicalize(&existing)?;
        for part in remainder.iter().rev() {
            resolved.push(part);
        }

        if !resolved.starts_with(&self.root) {
            return Err(MemError::PathTraversal(relative.to_path_buf()));
        }
        Ok(resolved)
    }

    /// Express an absolute path inside the workspace relative to the root.
    pub fn relative(&self, path: &Path) -> Result<PathBuf, MemError> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| MemError::PathTraversal(path.to_path_buf()))
    }

    // --- corpus -----------------------------------------------------------

    /// Every markdown file retrieval and scanning operate on, as paths
    /// relative to the root: decisions, tasks, entities, daily logs, staged
    /// proposals, and agent namespaces.
    pub fn corpus_files(&self) -> Result<Vec<PathBuf>, MemError> {
        let mut files = Vec::new();
        let push_if_md = |path: PathBuf, files: &mut Vec<PathBuf>| {
            if path.extension().is_some_and(|ext| ext == "md") {
                files.push(path);
            }
        };

        for fixed in [self.decisions_path(), self.tasks_path()] {
            if fixed.exists() {
                files.push(fixed);
            }
        }
        for dir in [self.entities_dir(), self.memory_dir(), self.proposed_dir()] {
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        push_if_md(entry.path(), &mut files);
                    }
                }
            }
        }
        collect_markdown_recursive(&self.agents_dir(), &mut files)?;

        let mut relative = Vec::with_capacity(files.len());
        for file in files {
            relative.push(self.relative(&file)?);
        }
        relative.sort();
        Ok(relative)
    }

    /// Parse the whole corpus in parallel. Parse problems are diagnostics,
    /// never failures.
    pub fn parse_corpus(&self) -> Result<(Vec<Block>, Vec<ParseDiagnostic>), MemError> {
        let files = self.corpus_files()?;
        let outcomes: Vec<_> = files
            .par_iter()
            .map(|relative| {
                let text = fs::read_to_string(self.root.join(relative)).unwrap_or_default();
                parser::parse_str(&text, relative)
            })
            .collect();

        let mut blocks = Vec::new();
        let mut diagnostics = Vec::new();
        for outcome in outcomes {
            blocks.extend(outcome.blocks);
            diagnostics.extend(outcome.diagnostics);
        }
        Ok((blocks, diagnostics))
    }

    /// Corpus epoch: changes whenever any corpus file's identity, size or
    /// mtime changes. Drives lazy retrieval index rebuilds.
    pub fn epoch(&self) -> Result<u64, MemError> {
        let mut stamp = String::new();
        for relative in self.corpus_files()? {
            let path = self.root.join(&relative);
            let meta = fs::metadata(&path)?;
            let mtime = meta
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            stamp.push_str(&format!("{}|{}|{}\n", relative.display(), meta.len(), mtime));
        }
        let hash = ContentHash::compute(stamp.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&hash.as_bytes()[..8]);
        Ok(u64::from_be_bytes(first))
    }

    // --- writes -----------------------------------------------------------

    /// Replace a workspace file atomically, honoring the append-only
    /// contract for daily logs.
    pub fn write_file(&self, relative: &Path, bytes: &[u8]) -> Result<(), MemError> {
        let target = self.contain(relative)?;
        if is_daily_log(relative) {
            let previous = match fs::read(&target) {
                Ok(existing) => existing,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            check_append_only(relative, &previous, bytes)?;
        }
        atomic_write(&target, bytes)
    }

    /// Append a timestamped entry to today's daily log. The log file is
    /// held under an exclusive kernel lock for the duration of the append.
    pub fn append_log(&self, text: &str) -> Result<PathBuf, MemError> {
        let now = Utc::now();
        let path = self.daily_log_path(now.date_naive());
        fs::create_dir_all(self.memory_dir())?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        let entry = format!("- {} {}\n", now.format("%H:%M"), text.trim_end());
        let outcome = file
            .write_all(entry.as_bytes())
            .and_then(|_| file.sync_all());
        if let Err(err) = FileExt::unlock(&file) {
            warn!(path = %path.display(), %err, "failed to unlock daily log");
        }
        outcome?;
        self.relative(&path)
    }

    /// Append a receipt to the audit trail.
    pub fn append_audit(&self, receipt: &Receipt) -> Result<(), MemError> {
        let path = self.audit_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(format!("\n{}", receipt.to_markdown()).as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Allocate a fresh receipt id.
    pub fn allocate_receipt(&self) -> ReceiptId {
        self.receipts.allocate()
    }
}

fn is_daily_log(relative: &Path) -> bool {
    relative.starts_with("memory")
        && relative
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").is_ok())
}

fn collect_markdown_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), MemError> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_markdown_recursive(&path, files)?;
        } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();

        assert!(workspace.decisions_path().exists());
        assert!(workspace.tasks_path().exists());
        assert!(workspace.config_path().exists());
        assert!(workspace.proposed_dir().exists());
        assert_eq!(workspace.mode(), GovernanceMode::DetectOnly);
    }

    #[test]
    fn test_contain_rejects_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();

        assert!(workspace.contain(Path::new("decisions/DECISIONS.md")).is_ok());
        assert!(matches!(
            workspace.contain(Path::new("../outside.md")),
            Err(MemError::PathTraversal(_))
        ));
        assert!(matches!(
            workspace.contain(Path::new("decisions/../../outside.md")),
            Err(MemError::PathTraversal(_))
        ));
        assert!(matches!(
            workspace.contain(Path::new("/etc/passwd")),
            Err(MemError::PathTraversal(_))
        ));
        // A contained path that does not exist yet is fine.
        assert!(workspace.contain(Path::new("memory/2026-02-13.md")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_contain_collapses_symlinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();
        let outside = dir.path().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, workspace.root().join("escape")).unwrap();

        assert!(matches!(
            workspace.contain(Path::new("escape/file.md")),
            Err(MemError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_daily_log_append_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();

        let log = workspace.append_log("shipped the migration").unwrap();
        let first = fs::read(workspace.root().join(&log)).unwrap();
        workspace.append_log("second entry").unwrap();
        let second = fs::read(workspace.root().join(&log)).unwrap();
        assert!(second.starts_with(&first));

        // A rewrite that truncates the log is refused.
        let result = workspace.write_file(&log, b"rewritten\n");
        assert!(matches!(result, Err(MemError::AppendOnlyViolation(_))));

        // A rewrite that strictly appends passes.
        let mut extended = second.clone();
        extended.extend_from_slice(b"- 23:59 tail\n");
        assert!(workspace.write_file(&log, &extended).is_ok());
    }

    #[test]
    fn test_corpus_and_epoch_move_together() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();

        let before = workspace.epoch().unwrap();
        workspace
            .write_file(
                Path::new("decisions/DECISIONS.md"),
                b"# Decisions\n\n## [D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use PostgreSQL\n",
            )
            .unwrap();
        let after = workspace.epoch().unwrap();
        assert_ne!(before, after);

        let (blocks, diagnostics) = workspace.parse_corpus().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(diagnostics.is_empty());
        assert!(
            workspace
                .corpus_files()
                .unwrap()
                .contains(&PathBuf::from("decisions/DECISIONS.md"))
        );
    }

    #[test]
    fn test_open_replays_unfinalized_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("ws");
        {
            let workspace = Workspace::init(&root).unwrap();
            workspace
                .write_file(Path::new("decisions/DECISIONS.md"), b"# Decisions\npre\n")
                .unwrap();

            // Simulate a crash between WAL begin and commit.
            let receipt: ReceiptId = workspace.allocate_receipt();
            let snapshots = workspace.snapshot_store();
            snapshots
                .take(
                    &receipt,
                    workspace.root(),
                    &[PathBuf::from("decisions/DECISIONS.md")],
                )
                .unwrap();
            let mut wal = Wal::open(workspace.wal_path()).unwrap();
            wal.begin(
                &receipt,
                &[(
                    PathBuf::from("decisions/DECISIONS.md"),
                    ContentHash::compute(b"# Decisions\npre\n"),
                    ContentHash::compute(b"# Decisions\npost\n"),
                )],
            )
            .unwrap();
            fs::write(root.join("decisions/DECISIONS.md"), b"# Decisions\nhalf").unwrap();
        }

        let reopened = Workspace::open(&root).unwrap();
        assert_eq!(
            fs::read(reopened.decisions_path()).unwrap(),
            b"# Decisions\npre\n"
        );
        let audit = fs::read_to_string(reopened.audit_path()).unwrap();
        assert!(audit.contains("Result: rolled_back"));
    }

    #[test]
    fn test_set_mode_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut workspace = Workspace::init(dir.path().join("ws")).unwrap();

        let refused = workspace.set_mode(GovernanceMode::Propose, CleanEvidence::default());
        assert!(refused.is_err());

        workspace
            .set_mode(
                GovernanceMode::Propose,
                CleanEvidence {
                    clean_windows: 1,
                    clean_weeks: 0,
                },
            )
            .unwrap();

        let reopened = Workspace::open(workspace.root()).unwrap();
        assert_eq!(reopened.mode(), GovernanceMode::Propose);
    }
}
