//! Apply engine: pre-check → snapshot → WAL-journaled mutation → post-check
//! → commit or rollback.
//!
//! Exactly one proposal is consumed per apply; there is no cascading. The
//! engine stages every new file content in memory first, so the WAL `begin`
//! records carry both pre- and post-mutation hashes and a crash at any point
//! is settled by startup replay. Mutations are append-or-replace at block
//! granularity: the only in-place edits ever made to an active block are the
//! status flip and the `SupersededBy` back-reference.
//!
//! Failure policy: pre-check errors never mutate state; mid-apply errors
//! restore every touched file from the snapshot, journal a rollback, mark
//! the proposal `failed`, and log a rollback receipt.

use std::{collections::HashSet, fs, path::PathBuf};

use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use similar::TextDiff;
use tracing::{info, warn};

use super::{
    integrity::{self, IntelState},
    proposal::{Proposal, ProposalStatus, ProposalType},
    validator::{self, ValidationIssue},
};
use crate::{
    block::{Block, BlockId, BlockKind},
    errors::MemError,
    store::{Receipt, ReceiptId, ReceiptResult, Wal},
    utils::ContentHash,
    workspace::Workspace,
};

/// A fully staged mutation: every touched file's complete new content.
struct Mutation {
    writes: IndexMap<PathBuf, String>,
    description: String,
}

/// Apply one staged proposal. Returns the receipt of the attempt.
///
/// With `dry_run` the pre-checks and planning run in full but nothing is
/// written; the returned receipt is not recorded in the audit trail.
pub fn apply_proposal(
    workspace: &Workspace,
    proposal_id: &BlockId,
    agent_id: &str,
    dry_run: bool,
) -> Result<Receipt, MemError> {
    let _guard = workspace.lock()?;
    let today = Utc::now().date_naive();

    // Parse once; this snapshot of the corpus drives planning and the
    // pre-apply halves of the post-check comparisons.
    let (blocks, diagnostics) = workspace.parse_corpus()?;
    let pre_issues = validator::validate(&blocks, &diagnostics);
    let pre_contradictions = contradiction_keys(&blocks, today);

    let proposal_block = blocks
        .iter()
        .find(|block| block.id() == proposal_id)
        .ok_or_else(|| MemError::BlockNotFound(proposal_id.to_string()))?;
    let staged_file = proposal_block.source_file().to_path_buf();
    let proposal = Proposal::from_block(proposal_block)?;

    // --- pre-check --------------------------------------------------------

    if !proposal.status().is_applicable() {
        return Err(MemError::PreCheck(format!(
            "proposal {proposal_id} has status `{}`",
            proposal.status()
        )));
    }
    workspace
        .mode()
        .require(workspace.mode().allows_apply(), "apply_proposal")?;

    let duplicate = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Proposal && block.id() != proposal_id)
        .filter_map(|block| Proposal::from_block(block).ok())
        .any(|other| {
            other.status() == ProposalStatus::Pending
                && other.dedupe_key() == proposal.dedupe_key()
        });
    if duplicate {
        return Err(MemError::PreCheck(format!(
            "another pending proposal stages the same (target, action) as {proposal_id}"
        )));
    }

    let mut state = IntelState::load(workspace, today)?;
    let budget = workspace.config().proposal_budget.per_day;
    if state.applies_today >= budget {
        return Err(MemError::BudgetExceeded(format!(
            "daily apply budget of {budget} reached"
        )));
    }

    let mutation = plan_mutation(workspace, &proposal, &staged_file, &blocks, today)?;

    for path in mutation.writes.keys() {
        workspace.contain(path)?;
        if !workspace.acl().can_write(agent_id, path) {
            return Err(MemError::AclDenied {
                agent: agent_id.to_string(),
                path: path.clone(),
            });
        }
    }

    if dry_run {
        let receipt_id = workspace.allocate_receipt();
        info!(proposal = %proposal_id, "dry run passed pre-checks");
        return Ok(Receipt::new(
            Some(proposal_id.clone()),
            format!("{} (dry-run)", mutation.description),
            ReceiptResult::Applied,
            receipt_id,
        ));
    }

    // --- snapshot + journal ----------------------------------------------

    let receipt_id = workspace.allocate_receipt();
    let touched: Vec<PathBuf> = mutation.writes.keys().cloned().collect();
    let snapshots = workspace.snapshot_store();
    snapshots.take(&receipt_id, workspace.root(), &touched)?;

    let mut wal = Wal::open(workspace.wal_path())?;
    let mut journal_entries = Vec::with_capacity(touched.len());
    let mut pre_bytes: IndexMap<PathBuf, Vec<u8>> = IndexMap::new();
    for (path, content) in &mutation.writes {
        let absolute = workspace.root().join(path);
        let previous = fs::read(&absolute).unwrap_or_default();
        journal_entries.push((
            path.clone(),
            ContentHash::compute(&previous),
            ContentHash::compute(content.as_bytes()),
        ));
        pre_bytes.insert(path.clone(), previous);
    }
    wal.begin(&receipt_id, &journal_entries)?;

    // --- execute + post-check --------------------------------------------

    let outcome = execute_and_check(
        workspace,
        &mutation,
        &pre_issues,
        &pre_contradictions,
        today,
    );

    match outcome {
        Ok(()) => {
            wal.commit(&receipt_id)?;
            let mut receipt = Receipt::new(
                Some(proposal_id.clone()),
                mutation.description.clone(),
                ReceiptResult::Applied,
                receipt_id,
            );
            receipt.set_diff(Some(render_diff(&pre_bytes, &mutation.writes)));
            workspace.append_audit(&receipt)?;
            state.applies_today += 1;
            state.save(workspace)?;
            info!(proposal = %proposal_id, receipt = %receipt.snapshot_id(), "proposal applied");
            Ok(receipt)
        }
        Err(err) => {
            warn!(proposal = %proposal_id, %err, "apply failed, rolling back");
            snapshots.restore(&receipt_id, workspace.root())?;
            wal.rollback(&receipt_id)?;
            mark_proposal(workspace, &blocks, proposal_id, &staged_file, "failed")?;
            let rollback_receipt = Receipt::new(
                Some(proposal_id.clone()),
                mutation.description.clone(),
                ReceiptResult::RolledBack,
                receipt_id,
            );
            workspace.append_audit(&rollback_receipt)?;
            Err(err)
        }
    }
}

fn execute_and_check(
    workspace: &Workspace,
    mutation: &Mutation,
    pre_issues: &[ValidationIssue],
    pre_contradictions: &HashSet<(String, String, String)>,
    today: NaiveDate,
) -> Result<(), MemError> {
    for (path, content) in &mutation.writes {
        workspace.write_file(path, content.as_bytes())?;
    }

    // Re-parse the mutated corpus and refuse any violation that did not
    // exist pre-apply. Line numbers shift when blocks are appended, so the
    // comparison key deliberately omits them.
    let issue_key = |issue: &ValidationIssue| {
        format!("{}|{}|{}", issue.check_id, issue.file.display(), issue.message)
    };
    let (blocks, diagnostics) = workspace.parse_corpus()?;
    let post_issues = validator::validate(&blocks, &diagnostics);
    let pre_failures: HashSet<String> = validator::failures(pre_issues)
        .iter()
        .map(|issue| issue_key(issue))
        .collect();
    for failure in validator::failures(&post_issues) {
        if !pre_failures.contains(&issue_key(failure)) {
            return Err(MemError::Validation(failure.to_string()));
        }
    }

    let post_contradictions = contradiction_keys(&blocks, today);
    for key in &post_contradictions {
        if !pre_contradictions.contains(key) {
            return Err(MemError::Validation(format!(
                "apply would introduce a contradiction on `{}` between {} and {}",
                key.0, key.1, key.2
            )));
        }
    }
    Ok(())
}

fn contradiction_keys(
    blocks: &[Block],
    today: NaiveDate,
) -> HashSet<(String, String, String)> {
    integrity::analyze(blocks, today, u32::MAX)
        .contradictions
        .into_iter()
        .map(|finding| {
            (
                finding.axis_key,
                finding.left.to_string(),
                finding.right.to_string(),
            )
        })
        .collect()
}

fn render_diff(
    before: &IndexMap<PathBuf, Vec<u8>>,
    after: &IndexMap<PathBuf, String>,
) -> String {
    let mut out = String::new();
    for (path, new_content) in after {
        let old_content = before
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let diff = TextDiff::from_lines(&old_content, new_content);
        let name = path.display().to_string();
        out.push_str(
            &diff
                .unified_diff()
                .context_radius(2)
                .header(&name, &name)
                .to_string(),
        );
    }
    out
}

/// Flip a proposal's staged status outside the journaled mutation. Used to
/// mark a rolled-back proposal `failed` after its file was restored.
fn mark_proposal(
    workspace: &Workspace,
    blocks: &[Block],
    proposal_id: &BlockId,
    staged_file: &std::path::Path,
    status: &str,
) -> Result<(), MemError> {
    let block = blocks
        .iter()
        .find(|block| block.id() == proposal_id)
        .ok_or_else(|| MemError::BlockNotFound(proposal_id.to_string()))?;
    let text = fs::read_to_string(workspace.root().join(staged_file))?;
    let flipped = flip_status(&text, block, status, None)?;
    workspace.write_file(&staged_file.to_path_buf(), flipped.as_bytes())
}

/// Rewrite a block's `Status` line in place within its source text,
/// optionally setting `SupersededBy`. No other line is touched.
fn flip_status(
    text: &str,
    block: &Block,
    new_status: &str,
    superseded_by: Option<&BlockId>,
) -> Result<String, MemError> {
    let (start, end) = block.line_range();
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut status_line = None;
    let mut superseded_line = None;

    for (index, line) in lines.iter().enumerate() {
        let line_no = index + 1;
        if line_no < start || line_no > end {
            continue;
        }
        if line.starts_with("Status:") {
            status_line = Some(index);
        } else if line.starts_with("SupersededBy:") {
            superseded_line = Some(index);
        }
    }

    let status_index = status_line.ok_or_else(|| {
        MemError::Validation(format!("{} has no Status line to flip", block.id()))
    })?;
    lines[status_index] = format!("Status: {new_status}");

    if let Some(successor) = superseded_by {
        let reference = format!("SupersededBy: {successor}");
        match superseded_line {
            Some(index) => lines[index] = reference,
            None => lines.insert(status_index + 1, reference),
        }
    }

    let mut rebuilt = lines.join("\n");
    if text.ends_with('\n') {
        rebuilt.push('\n');
    }
    Ok(rebuilt)
}

/// Append a block to a file's text with a separating blank line.
fn append_block(text: &str, block: &Block) -> String {
    let mut rebuilt = text.to_string();
    if !rebuilt.is_empty() && !rebuilt.ends_with('\n') {
        rebuilt.push('\n');
    }
    if !rebuilt.is_empty() {
        rebuilt.push('\n');
    }
    rebuilt.push_str(&block.to_markdown());
    rebuilt
}

/// Build a constraint signature from `Axis`/`Object` payload fields, when a
/// proposal stages a constrained decision. `Enforcement` defaults to hard,
/// `Domain` to the axis root.
fn signature_from_payload(
    proposal: &Proposal,
) -> Result<Option<crate::block::ConstraintSignature>, MemError> {
    let (Some(axis), Some(object)) = (
        proposal.payload_field("Axis"),
        proposal.payload_field("Object"),
    ) else {
        return Ok(None);
    };
    let mut pairs: Vec<(String, String)> = vec![
        ("axis.key".to_string(), axis.to_string()),
        (
            "relation".to_string(),
            proposal
                .payload_field("Relation")
                .unwrap_or("must_be")
                .to_string(),
        ),
        ("object".to_string(), object.to_string()),
        (
            "enforcement".to_string(),
            proposal
                .payload_field("Enforcement")
                .unwrap_or("hard")
                .to_string(),
        ),
        (
            "domain".to_string(),
            proposal
                .payload_field("Domain")
                .unwrap_or_else(|| axis.split('.').next().unwrap_or(axis))
                .to_string(),
        ),
    ];
    if let Some(priority) = proposal.payload_field("Priority") {
        pairs.push(("priority".to_string(), priority.to_string()));
    }
    crate::block::ConstraintSignature::from_pairs(&pairs).map(Some)
}

fn plan_mutation(
    workspace: &Workspace,
    proposal: &Proposal,
    staged_file: &std::path::Path,
    blocks: &[Block],
    today: NaiveDate,
) -> Result<Mutation, MemError> {
    let mut writes: IndexMap<PathBuf, String> = IndexMap::new();
    let read_current = |workspace: &Workspace, path: &std::path::Path| -> Result<String, MemError> {
        match fs::read_to_string(workspace.root().join(path)) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    };
    let find_target = |id: &BlockId| -> Result<&Block, MemError> {
        blocks
            .iter()
            .find(|block| block.id() == id)
            .ok_or_else(|| MemError::BlockNotFound(id.to_string()))
    };
    let payload_required = |key: &str| -> Result<&str, MemError> {
        proposal.payload_field(key).ok_or_else(|| {
            MemError::InvalidProposal(format!(
                "{} `{}` proposal is missing payload `{key}`",
                proposal.id(),
                proposal.proposal_type()
            ))
        })
    };
    let target_required = || -> Result<&BlockId, MemError> {
        proposal.target().ok_or_else(|| {
            MemError::InvalidProposal(format!(
                "{} `{}` proposal has no target",
                proposal.id(),
                proposal.proposal_type()
            ))
        })
    };

    let description;
    match proposal.proposal_type() {
        ProposalType::NewDecision => {
            let statement = payload_required("Statement")?;
            let path = PathBuf::from("decisions/DECISIONS.md");
            let seq = integrity::next_seq_for(blocks, BlockKind::Decision, today);
            let id = BlockId::next(BlockKind::Decision, today, seq.saturating_sub(1))?;
            let mut block = Block::new(id.clone(), path.clone());
            block.push_field("Date", today.format("%Y-%m-%d").to_string());
            block.push_field("Status", "active");
            block.push_field("Statement", statement);
            if let Some(signature) = signature_from_payload(proposal)? {
                block.push_signature(signature);
            }
            let text = read_current(workspace, &path)?;
            writes.insert(path, append_block(&text, &block));
            description = format!("new_decision {id}");
        }
        ProposalType::NewTask => {
            let title = payload_required("Title")?;
            let path = PathBuf::from("tasks/TASKS.md");
            let seq = integrity::next_seq_for(blocks, BlockKind::Task, today);
            let id = BlockId::next(BlockKind::Task, today, seq.saturating_sub(1))?;
            let mut block = Block::new(id.clone(), path.clone());
            block.push_field("Date", today.format("%Y-%m-%d").to_string());
            block.push_field("Status", "open");
            block.push_field("Title", title);
            if let Some(aligns) = proposal.payload_field("AlignsWith") {
                block.push_field("AlignsWith", aligns);
            }
            let text = read_current(workspace, &path)?;
            writes.insert(path, append_block(&text, &block));
            description = format!("new_task {id}");
        }
        ProposalType::Supersede => {
            let target_id = target_required()?;
            let target = find_target(target_id)?;
            if target.kind() != BlockKind::Decision {
                return Err(MemError::InvalidProposal(format!(
                    "{} supersedes {target_id}, which is not a decision",
                    proposal.id()
                )));
            }
            let statement = payload_required("Statement")?;
            let path = target.source_file().to_path_buf();
            let seq = integrity::next_seq_for(blocks, BlockKind::Decision, today);
            let successor_id = BlockId::next(BlockKind::Decision, today, seq.saturating_sub(1))?;

            let mut successor = Block::new(successor_id.clone(), path.clone());
            successor.push_field("Date", today.format("%Y-%m-%d").to_string());
            successor.push_field("Status", "active");
            successor.push_field("Statement", statement);
            successor.push_field("Supersedes", target_id.to_string());
            if let Some(signature) = signature_from_payload(proposal)? {
                successor.push_signature(signature);
            }

            let text = read_current(workspace, &path)?;
            let flipped = flip_status(&text, target, "superseded", Some(&successor_id))?;
            writes.insert(path, append_block(&flipped, &successor));
            description = format!("supersede {target_id} -> {successor_id}");
        }
        ProposalType::StatusChange => {
            let target_id = target_required()?;
            let target = find_target(target_id)?;
            let new_status = payload_required("NewStatus")?;
            let vocabulary = target.kind().status_values().ok_or_else(|| {
                MemError::InvalidProposal(format!(
                    "{} blocks carry no status",
                    target.kind()
                ))
            })?;
            if !vocabulary.contains(&new_status) {
                return Err(MemError::InvalidStatus {
                    status: new_status.to_string(),
                    kind: target.kind().to_string(),
                });
            }
            let path = target.source_file().to_path_buf();
            let text = read_current(workspace, &path)?;
            writes.insert(path, flip_status(&text, target, new_status, None)?);
            description = format!("status_change {target_id} -> {new_status}");
        }
        ProposalType::Archive => {
            let target_id = target_required()?;
            let target = find_target(target_id)?;
            let archivable = target
                .kind()
                .status_values()
                .is_some_and(|vocabulary| vocabulary.contains(&"archived"));
            if !archivable {
                return Err(MemError::InvalidProposal(format!(
                    "{} blocks cannot be archived",
                    target.kind()
                )));
            }
            let path = target.source_file().to_path_buf();
            let text = read_current(workspace, &path)?;
            writes.insert(path, flip_status(&text, target, "archived", None)?);
            description = format!("archive {target_id}");
        }
        ProposalType::Merge => {
            let target_id = target_required()?;
            let target = find_target(target_id)?;
            let into_id: BlockId = payload_required("Into")?.parse()?;
            let into = find_target(&into_id)?;
            if into.kind() != target.kind() {
                return Err(MemError::InvalidProposal(format!(
                    "{} merges {target_id} into {into_id}, but the kinds differ",
                    proposal.id()
                )));
            }
            let path = target.source_file().to_path_buf();
            let text = read_current(workspace, &path)?;
            writes.insert(
                path,
                flip_status(&text, target, "superseded", Some(&into_id))?,
            );
            description = format!("merge {target_id} -> {into_id}");
        }
    }

    // The proposal itself flips to `applied` as part of the same journaled
    // mutation, so a rollback restores it to `pending` automatically.
    let proposal_block = find_target(proposal.id())?;
    let staged_rel = staged_file.to_path_buf();
    let staged_text = match writes.get(&staged_rel) {
        Some(pending_edit) => pending_edit.clone(),
        None => read_current(workspace, &staged_rel)?,
    };
    writes.insert(
        staged_rel,
        flip_status(&staged_text, proposal_block, "applied", None)?,
    );

    Ok(Mutation {
        writes,
        description,
    })
}

/// Restore a committed receipt's snapshot: the inverse of its apply. The
/// restoration itself is journaled, so a crash mid-rollback replays safely.
pub fn rollback(workspace: &Workspace, receipt_id: &ReceiptId) -> Result<Receipt, MemError> {
    let _guard = workspace.lock()?;
    let snapshots = workspace.snapshot_store();
    let manifest = snapshots.manifest(receipt_id)?;

    let mut wal = Wal::open(workspace.wal_path())?;
    let undo_id = workspace.allocate_receipt();
    let mut entries = Vec::with_capacity(manifest.entries.len());
    let touched: Vec<PathBuf> = manifest.entries.iter().map(|e| e.path.clone()).collect();
    for entry in &manifest.entries {
        let current = ContentHash::of_file(&workspace.root().join(&entry.path))?;
        entries.push((entry.path.clone(), current, entry.hash));
    }
    // Snapshot the current state so the rollback itself can be undone or
    // replayed after a crash.
    snapshots.take(&undo_id, workspace.root(), &touched)?;
    wal.begin(&undo_id, &entries)?;
    snapshots.restore(receipt_id, workspace.root())?;
    wal.commit(&undo_id)?;

    let receipt = Receipt::new(
        None,
        format!("rollback of {receipt_id}"),
        ReceiptResult::RolledBack,
        undo_id,
    );
    workspace.append_audit(&receipt)?;
    info!(receipt = %receipt_id, "receipt rolled back");
    Ok(receipt)
}

/// Auto-apply pending low-risk proposals, permitted only in `enforce` mode.
/// Supersession and merges are never auto-applied.
pub fn auto_apply(workspace: &Workspace, agent_id: &str) -> Result<Vec<Receipt>, MemError> {
    workspace
        .mode()
        .require(workspace.mode().allows_auto_apply(), "auto_apply")?;

    let (blocks, _diagnostics) = workspace.parse_corpus()?;
    let candidates: Vec<BlockId> = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Proposal)
        .filter_map(|block| Proposal::from_block(block).ok())
        .filter(|proposal| {
            proposal.status() == ProposalStatus::Pending
                && proposal.proposal_type().is_low_risk()
        })
        .map(|proposal| proposal.id().clone())
        .collect();

    let mut receipts = Vec::new();
    for proposal_id in candidates {
        match apply_proposal(workspace, &proposal_id, agent_id, false) {
            Ok(receipt) => receipts.push(receipt),
            Err(MemError::BudgetExceeded(_)) => break,
            Err(err) => warn!(proposal = %proposal_id, %err, "auto-apply skipped"),
        }
    }
    Ok(receipts)
}
