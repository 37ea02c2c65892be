//! Compaction: the only path that physically removes data.
//!
//! Everything else in the workspace is append-or-replace at block
//! granularity; destruction is logical (status `archived`). This pass moves
//! archived blocks older than the retention window into dated archive files
//! next to their source, prunes expired snapshots, deletes daily logs past
//! the log retention, and drops stale signal blocks. All windows come from
//! the `compaction.*` config keys.

use std::{fs, path::PathBuf};

use chrono::{Datelike, Duration, NaiveDate, Utc};
use tracing::info;

use crate::{
    block::{Block, parser},
    errors::MemError,
    utils::atomic_write,
    workspace::Workspace,
};

/// What one compaction pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub blocks_archived: usize,
    pub snapshots_removed: usize,
    pub logs_removed: usize,
    pub signals_removed: usize,
}

/// Run the full compaction pass under the workspace lock.
pub fn compact(workspace: &Workspace) -> Result<CompactionReport, MemError> {
    let _guard = workspace.lock()?;
    let today = Utc::now().date_naive();
    let retention = workspace.config().compaction.clone();
    let mut report = CompactionReport::default();

    // Archived blocks move to dated archive files beside their source.
    let archive_cutoff = today - Duration::days(retention.archive_days as i64);
    let mut sources = vec![
        PathBuf::from("decisions/DECISIONS.md"),
        PathBuf::from("tasks/TASKS.md"),
    ];
    for name in ["projects", "people", "tools", "incidents"] {
        sources.push(PathBuf::from(format!("entities/{name}.md")));
    }
    for source in sources {
        report.blocks_archived += archive_blocks(workspace, &source, archive_cutoff)?;
    }

    report.snapshots_removed = workspace
        .snapshot_store()
        .compact(retention.snapshot_days)?;

    // Daily logs past the log retention are deleted outright.
    let log_cutoff = today - Duration::days(retention.log_days as i64);
    if let Ok(entries) = fs::read_dir(workspace.memory_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".md")) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date < log_cutoff {
                fs::remove_file(entry.path())?;
                report.logs_removed += 1;
            }
        }
    }

    // Stale signal blocks fall off the report.
    let signal_cutoff = today - Duration::days(retention.signal_days as i64);
    report.signals_removed = prune_signals(workspace, signal_cutoff)?;

    info!(
        blocks = report.blocks_archived,
        snapshots = report.snapshots_removed,
        logs = report.logs_removed,
        signals = report.signals_removed,
        "compaction pass complete"
    );
    Ok(report)
}

/// Move archived blocks older than `cutoff` from `source` into a dated
/// archive file (`<stem>-archive-YYYY-MM.md`) in the same directory.
fn archive_blocks(
    workspace: &Workspace,
    source: &PathBuf,
    cutoff: NaiveDate,
) -> Result<usize, MemError> {
    let absolute = workspace.root().join(source);
    let text = match fs::read_to_string(&absolute) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let outcome = parser::parse_str(&text, source);
    let expired: Vec<&Block> = outcome
        .blocks
        .iter()
        .filter(|block| {
            block.status() == Some("archived")
                && block.date().map(|date| date < cutoff).unwrap_or(false)
        })
        .collect();
    if expired.is_empty() {
        return Ok(0);
    }

    // Drop the expired blocks' line spans from the source text.
    let mut drop_lines = vec![false; text.lines().count()];
    for block in &expired {
        let (start, end) = block.line_range();
        for flag in drop_lines.iter_mut().take(end).skip(start - 1) {
            *flag = true;
        }
    }
    let mut kept: Vec<&str> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if !drop_lines[index] {
            kept.push(line);
        }
    }
    let mut rebuilt = kept.join("\n");
    while rebuilt.contains("\n\n\n") {
        rebuilt = rebuilt.replace("\n\n\n", "\n\n");
    }
    if !rebuilt.ends_with('\n') {
        rebuilt.push('\n');
    }
    workspace.write_file(source, rebuilt.as_bytes())?;

    // Append each expired block to the archive file for its month.
    for block in &expired {
        let month = block
            .date()
            .map(|date| format!("{:04}-{:02}", date.year(), date.month()))
            .unwrap_or_else(|| "undated".to_string());
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("blocks");
        let archive_rel = source
            .parent()
            .map(|dir| dir.join(format!("{stem}-archive-{month}.md")))
            .unwrap_or_else(|| PathBuf::from(format!("{stem}-archive-{month}.md")));

        let archive_abs = workspace.root().join(&archive_rel);
        let mut archive_text = match fs::read_to_string(&archive_abs) {
            Ok(existing) => existing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                format!("# Archive {month}\n")
            }
            Err(err) => return Err(err.into()),
        };
        archive_text.push('\n');
        archive_text.push_str(&block.to_markdown());
        atomic_write(&archive_abs, archive_text.as_bytes())?;
    }
    Ok(expired.len())
}

fn prune_signals(workspace: &Workspace, cutoff: NaiveDate) -> Result<usize, MemError> {
    let path = workspace.signals_path();
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let outcome = parser::parse_str(&text, &PathBuf::from("intelligence/SIGNALS.md"));
    let keep: Vec<&Block> = outcome
        .blocks
        .iter()
        .filter(|block| block.date().map(|date| date >= cutoff).unwrap_or(true))
        .collect();
    let removed = outcome.blocks.len() - keep.len();
    if removed == 0 {
        return Ok(0);
    }

    let mut rebuilt = String::from("# Signals\n");
    for block in keep {
        rebuilt.push('\n');
        rebuilt.push_str(&block.to_markdown());
    }
    workspace.write_file(&PathBuf::from("intelligence/SIGNALS.md"), rebuilt.as_bytes())?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_archived_blocks_move_to_dated_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();
        workspace
            .write_file(
                Path::new("decisions/DECISIONS.md"),
                b"# Decisions\n\n\
## [D-20240101-001]\n\
Date: 2024-01-01\n\
Status: archived\n\
Statement: Long dead\n\
\n\
## [D-20260101-001]\n\
Date: 2026-01-01\n\
Status: active\n\
Statement: Still relevant\n",
            )
            .unwrap();

        let report = compact(&workspace).unwrap();
        assert_eq!(report.blocks_archived, 1);

        let remaining = fs::read_to_string(workspace.decisions_path()).unwrap();
        assert!(!remaining.contains("D-20240101-001"));
        assert!(remaining.contains("D-20260101-001"));

        let archive = fs::read_to_string(
            workspace
                .root()
                .join("decisions/DECISIONS-archive-2024-01.md"),
        )
        .unwrap();
        assert!(archive.contains("## [D-20240101-001]"));
        assert!(archive.contains("Statement: Long dead"));
    }

    #[test]
    fn test_recent_archived_blocks_stay() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();
        let today = Utc::now().date_naive();
        let content = format!(
            "# Decisions\n\n## [D-{}-001]\nDate: {}\nStatus: archived\nStatement: Freshly archived\n",
            today.format("%Y%m%d"),
            today.format("%Y-%m-%d"),
        );
        workspace
            .write_file(Path::new("decisions/DECISIONS.md"), content.as_bytes())
            .unwrap();

        let report = compact(&workspace).unwrap();
        assert_eq!(report.blocks_archived, 0);
        assert!(
            fs::read_to_string(workspace.decisions_path())
                .unwrap()
                .contains("Freshly archived")
        );
    }

    #[test]
    fn test_old_logs_and_signals_pruned() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::init(dir.path().join("ws")).unwrap();
        workspace
            .write_file(Path::new("memory/2020-01-01.md"), b"- 10:00 ancient note\n")
            .unwrap();
        let today = Utc::now().date_naive();
        let signals = format!(
            "# Signals\n\n\
## [SIG-20200101-001]\nDate: 2020-01-01\nSummary: stale signal\n\n\
## [SIG-{}-001]\nDate: {}\nSummary: recent signal\n",
            today.format("%Y%m%d"),
            today.format("%Y-%m-%d"),
        );
        workspace
            .write_file(Path::new("intelligence/SIGNALS.md"), signals.as_bytes())
            .unwrap();

        let report = compact(&workspace).unwrap();
        assert_eq!(report.logs_removed, 1);
        assert_eq!(report.signals_removed, 1);
        assert!(!workspace.root().join("memory/2020-01-01.md").exists());
        let signals = fs::read_to_string(workspace.signals_path()).unwrap();
        assert!(!signals.contains("SIG-20200101-001"));
        assert!(signals.contains("recent signal"));
    }
}
