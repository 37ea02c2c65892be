//! Content snapshot store.
//!
//! Before a proposal mutates anything, every touched file is copied
//! byte-identically under `intelligence/state/snapshots/<receipt_id>/`,
//! alongside a manifest listing relative paths, pre-apply hashes, and
//! whether each file existed. Restoration is a flat overwrite of the
//! manifest-listed paths; files that did not exist pre-apply are removed.
//! Snapshots older than the configured retention are pruned by compaction.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::receipt::ReceiptId;
use crate::{
    errors::MemError,
    utils::{ContentHash, atomic_write},
};

/// One file captured by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the workspace root.
    pub path: PathBuf,
    /// Hash of the pre-apply bytes (empty-buffer hash when absent).
    pub hash: ContentHash,
    /// Whether the file existed when the snapshot was taken.
    pub existed: bool,
}

/// Manifest describing one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub receipt: ReceiptId,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

/// Content-addressed pre-mutation copies keyed by receipt id.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// `root` is `intelligence/state/snapshots` under the workspace.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, receipt: &ReceiptId) -> PathBuf {
        self.root.join(receipt.as_str())
    }

    fn manifest_path(&self, receipt: &ReceiptId) -> PathBuf {
        self.dir_for(receipt).join("manifest.json")
    }

    fn file_store(&self, receipt: &ReceiptId) -> PathBuf {
        self.dir_for(receipt).join("files")
    }

    /// Capture the current bytes of `touched` (relative paths) under
    /// `workspace_root`, keyed by `receipt`.
    pub fn take(
        &self,
        receipt: &ReceiptId,
        workspace_root: &Path,
        touched: &[PathBuf],
    ) -> Result<SnapshotManifest, MemError> {
        let store = self.file_store(receipt);
        let mut entries = Vec::with_capacity(touched.len());

        for relative in touched {
            let source = workspace_root.join(relative);
            let existed = source.exists();
            let hash = ContentHash::of_file(&source)?;
            if existed {
                let copy = store.join(relative);
                if let Some(parent) = copy.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&source, &copy)?;
            }
            entries.push(ManifestEntry {
                path: relative.clone(),
                hash,
                existed,
            });
        }

        let manifest = SnapshotManifest {
            receipt: receipt.clone(),
            created_at: Utc::now(),
            entries,
        };
        atomic_write(
            &self.manifest_path(receipt),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        debug!(receipt = %receipt, files = manifest.entries.len(), "snapshot taken");
        Ok(manifest)
    }

    /// Load a snapshot's manifest.
    pub fn manifest(&self, receipt: &ReceiptId) -> Result<SnapshotManifest, MemError> {
        let path = self.manifest_path(receipt);
        let bytes = fs::read(&path).map_err(|err| {
            MemError::InvalidSnapshot(receipt.to_string(), format!("manifest unreadable: {err}"))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            MemError::InvalidSnapshot(receipt.to_string(), format!("manifest malformed: {err}"))
        })
    }

    /// Restore every manifest-listed path to its pre-apply bytes.
    pub fn restore(&self, receipt: &ReceiptId, workspace_root: &Path) -> Result<(), MemError> {
        let manifest = self.manifest(receipt)?;
        for entry in &manifest.entries {
            self.restore_entry(receipt, workspace_root, entry)?;
        }
        info!(receipt = %receipt, files = manifest.entries.len(), "snapshot restored");
        Ok(())
    }

    /// Restore a single path from a snapshot. Used by WAL replay.
    pub fn restore_path(
        &self,
        receipt: &ReceiptId,
        workspace_root: &Path,
        relative: &Path,
    ) -> Result<(), MemError> {
        let manifest = self.manifest(receipt)?;
        let entry = manifest
            .entries
            .iter()
            .find(|entry| entry.path == relative)
            .ok_or_else(|| {
                MemError::InvalidSnapshot(
                    receipt.to_string(),
                    format!("`{}` not in manifest", relative.display()),
                )
            })?;
        self.restore_entry(receipt, workspace_root, entry)
    }

    fn restore_entry(
        &self,
        receipt: &ReceiptId,
        workspace_root: &Path,
        entry: &ManifestEntry,
    ) -> Result<(), MemError> {
        let target = workspace_root.join(&entry.path);
        if entry.existed {
            let copy = self.file_store(receipt).join(&entry.path);
            let bytes = fs::read(&copy).map_err(|err| {
                MemError::InvalidSnapshot(
                    receipt.to_string(),
                    format!("copy of `{}` unreadable: {err}", entry.path.display()),
                )
            })?;
            atomic_write(&target, &bytes)?;
        } else if target.exists() {
            // The file was created by the mutation being undone.
            fs::remove_file(&target)?;
        }
        Ok(())
    }

    /// Delete snapshot directories older than `retention_days`. Returns the
    /// number of snapshots removed.
    pub fn compact(&self, retention_days: u32) -> Result<usize, MemError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let mut removed = 0;

        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(receipt) = dir_entry.file_name().to_string_lossy().parse::<ReceiptId>()
            else {
                warn!(path = %dir_entry.path().display(), "unrecognized snapshot directory");
                continue;
            };
            match self.manifest(&receipt) {
                Ok(manifest) if manifest.created_at < cutoff => {
                    fs::remove_dir_all(dir_entry.path())?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(receipt = %receipt, %err, "snapshot without readable manifest, skipping");
                }
            }
        }
        if removed > 0 {
            info!(removed, "snapshot compaction pass complete");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(n: u32) -> ReceiptId {
        format!("20260213-1015{:02}-000", n).parse().unwrap()
    }

    #[test]
    fn test_take_and_restore_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("decisions")).unwrap();
        fs::write(root.join("decisions/DECISIONS.md"), b"original").unwrap();

        let store = SnapshotStore::new(root.join("intelligence/state/snapshots"));
        let id = receipt(0);
        let touched = vec![
            PathBuf::from("decisions/DECISIONS.md"),
            PathBuf::from("tasks/TASKS.md"),
        ];
        let manifest = store.take(&id, root, &touched).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.entries[0].existed);
        assert!(!manifest.entries[1].existed);

        // Mutate both paths, then restore.
        fs::write(root.join("decisions/DECISIONS.md"), b"mutated").unwrap();
        fs::create_dir_all(root.join("tasks")).unwrap();
        fs::write(root.join("tasks/TASKS.md"), b"created by apply").unwrap();

        store.restore(&id, root).unwrap();
        assert_eq!(
            fs::read(root.join("decisions/DECISIONS.md")).unwrap(),
            b"original"
        );
        assert!(!root.join("tasks/TASKS.md").exists());
    }

    #[test]
    fn test_restore_single_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("memory")).unwrap();
        fs::write(root.join("memory/2026-02-13.md"), b"log line\n").unwrap();

        let store = SnapshotStore::new(root.join("snapshots"));
        let id = receipt(1);
        store
            .take(&id, root, &[PathBuf::from("memory/2026-02-13.md")])
            .unwrap();

        fs::write(root.join("memory/2026-02-13.md"), b"clobbered").unwrap();
        store
            .restore_path(&id, root, Path::new("memory/2026-02-13.md"))
            .unwrap();
        assert_eq!(
            fs::read(root.join("memory/2026-02-13.md")).unwrap(),
            b"log line\n"
        );

        let missing = store.restore_path(&id, root, Path::new("memory/other.md"));
        assert!(matches!(missing, Err(MemError::InvalidSnapshot(_, _))));
    }

    #[test]
    fn test_compact_prunes_old_snapshots() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.md"), b"x").unwrap();

        let store = SnapshotStore::new(root.join("snapshots"));
        let id = receipt(2);
        store.take(&id, root, &[PathBuf::from("a.md")]).unwrap();

        // Fresh snapshot survives a 30-day retention pass.
        assert_eq!(store.compact(30).unwrap(), 0);

        // Age the manifest far past the cutoff and compact again.
        let mut manifest = store.manifest(&id).unwrap();
        manifest.created_at = Utc::now() - Duration::days(90);
        atomic_write(
            &store.manifest_path(&id),
            &serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
        assert_eq!(store.compact(30).unwrap(), 1);
        assert!(!store.dir_for(&id).exists());
    }
}
