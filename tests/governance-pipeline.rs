//! End-to-end pipeline tests: scan, propose, apply, rollback, and
//! concurrent applies over a real temporary workspace.

use std::{fs, path::Path, sync::Arc};

use chrono::Utc;
use mem_os::{
    Workspace,
    block::BlockKind,
    governance::{
        self, CleanEvidence, GovernanceMode, Proposal, ProposalType,
        apply::{apply_proposal, rollback},
    },
    recall::{self, RecallOptions},
    store::ReceiptResult,
};

fn propose_workspace(dir: &tempfile::TempDir) -> Workspace {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut workspace = Workspace::init(dir.path().join("ws")).unwrap();
    workspace
        .set_mode(
            GovernanceMode::Propose,
            CleanEvidence {
                clean_windows: 1,
                clean_weeks: 0,
            },
        )
        .unwrap();
    workspace
}

fn seed_contradicting_decisions(workspace: &Workspace) {
    workspace
        .write_file(
            Path::new("decisions/DECISIONS.md"),
            b"# Decisions\n\n\
## [D-20260101-001]\n\
Date: 2026-01-01\n\
Status: active\n\
Statement: Use PostgreSQL for persistence\n\
ConstraintSignatures:\n\
  - axis.key: database.engine\n\
    relation: must_be\n\
    object: postgresql\n\
    enforcement: hard\n\
    domain: db\n\
    priority: 9\n\
\n\
## [D-20260105-001]\n\
Date: 2026-01-05\n\
Status: active\n\
Statement: Use MySQL for persistence\n\
ConstraintSignatures:\n\
  - axis.key: database.engine\n\
    relation: must_be\n\
    object: mysql\n\
    enforcement: hard\n\
    domain: db\n\
    priority: 7\n",
        )
        .unwrap();
}

#[test]
fn scan_reports_contradiction_with_priority_tie_break() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = propose_workspace(&dir);
    seed_contradicting_decisions(&workspace);

    let report = governance::scan(&workspace).unwrap();
    assert_eq!(report.contradictions.len(), 1);
    let finding = &report.contradictions[0];
    assert_eq!(finding.axis_key, "database.engine");
    // Priority 9 beats 7: the 7-priority decision is the supersede candidate.
    assert_eq!(finding.supersede_candidate.to_string(), "D-20260105-001");

    // The report file round-trips through list_contradictions.
    let listed = governance::list_contradictions(&workspace).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].supersede_candidate, finding.supersede_candidate);

    // In propose mode the scan stages a resolution proposal.
    assert!(!report.staged.is_empty());
    let staged_files: Vec<_> = fs::read_dir(workspace.proposed_dir())
        .unwrap()
        .flatten()
        .collect();
    assert!(!staged_files.is_empty());

    // Re-scanning the unchanged corpus does not stage a duplicate.
    let second = governance::scan(&workspace).unwrap();
    assert!(second.staged.is_empty());
}

#[test]
fn supersede_apply_updates_predecessor_and_audit() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = propose_workspace(&dir);
    seed_contradicting_decisions(&workspace);

    let mut proposal = Proposal::new(
        "P-20260213-001".parse().unwrap(),
        Utc::now().date_naive(),
        ProposalType::Supersede,
        Some("D-20260105-001".parse().unwrap()),
        "fold the mysql decision".to_string(),
        "resolving the database.engine contradiction".to_string(),
    )
    .unwrap();
    proposal.set_payload_field("Statement", "Consolidate on PostgreSQL");
    workspace
        .write_file(
            &proposal.staged_path(),
            format!("# Proposed\n\n{}", proposal.to_block().to_markdown()).as_bytes(),
        )
        .unwrap();

    let receipt = apply_proposal(&workspace, proposal.id(), "operator", false).unwrap();
    assert_eq!(receipt.result(), ReceiptResult::Applied);

    let (blocks, _) = workspace.parse_corpus().unwrap();
    let old = blocks
        .iter()
        .find(|b| b.id().to_string() == "D-20260105-001")
        .unwrap();
    assert_eq!(old.status(), Some("superseded"));
    let successor_id = old.superseded_by().unwrap();
    let successor = blocks.iter().find(|b| b.id() == &successor_id).unwrap();
    assert_eq!(successor.kind(), BlockKind::Decision);
    assert_eq!(successor.status(), Some("active"));
    assert_eq!(
        successor.field("Statement"),
        Some("Consolidate on PostgreSQL")
    );

    // Post-check held: the contradiction is resolved, the audit has the
    // receipt, and a follow-up scan finds nothing.
    let audit = fs::read_to_string(workspace.audit_path()).unwrap();
    assert!(audit.contains(&format!("Proposal: {}", proposal.id())));
    let report = governance::scan(&workspace).unwrap();
    assert!(report.contradictions.is_empty());
}

#[test]
fn apply_then_rollback_is_byte_identical() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = propose_workspace(&dir);
    seed_contradicting_decisions(&workspace);
    let before = fs::read(workspace.decisions_path()).unwrap();

    let mut proposal = Proposal::new(
        "P-20260213-002".parse().unwrap(),
        Utc::now().date_naive(),
        ProposalType::Supersede,
        Some("D-20260105-001".parse().unwrap()),
        "swap the loser".to_string(),
        "round trip".to_string(),
    )
    .unwrap();
    proposal.set_payload_field("Statement", "Consolidate on PostgreSQL");
    workspace
        .write_file(
            &proposal.staged_path(),
            format!("# Proposed\n\n{}", proposal.to_block().to_markdown()).as_bytes(),
        )
        .unwrap();

    let receipt = apply_proposal(&workspace, proposal.id(), "operator", false).unwrap();
    assert_ne!(fs::read(workspace.decisions_path()).unwrap(), before);

    rollback(&workspace, receipt.snapshot_id()).unwrap();
    assert_eq!(fs::read(workspace.decisions_path()).unwrap(), before);
}

#[test]
fn concurrent_applies_serialize_with_distinct_receipts() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = propose_workspace(&dir);
    workspace
        .write_file(
            Path::new("tasks/TASKS.md"),
            b"# Tasks\n\n\
## [T-20260102-001]\n\
Date: 2026-01-02\n\
Status: open\n\
Title: First task\n\
\n\
## [T-20260102-002]\n\
Date: 2026-01-02\n\
Status: open\n\
Title: Second task\n",
        )
        .unwrap();

    let workspace = Arc::new(workspace);
    let mut handles = Vec::new();
    for (index, target) in ["T-20260102-001", "T-20260102-002"].iter().enumerate() {
        let mut proposal = Proposal::new(
            format!("P-20260213-00{}", index + 3).parse().unwrap(),
            Utc::now().date_naive(),
            ProposalType::StatusChange,
            Some(target.parse().unwrap()),
            format!("close {target}"),
            "wrapping up".to_string(),
        )
        .unwrap();
        proposal.set_payload_field("NewStatus", "done");
        workspace
            .write_file(
                &proposal.staged_path(),
                format!("# Proposed\n\n{}", proposal.to_block().to_markdown()).as_bytes(),
            )
            .unwrap();

        let shared = Arc::clone(&workspace);
        handles.push(std::thread::spawn(move || {
            apply_proposal(&shared, proposal.id(), "operator", false)
        }));
    }

    let receipts: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    assert_eq!(receipts.len(), 2);
    assert_ne!(receipts[0].snapshot_id(), receipts[1].snapshot_id());

    let text = fs::read_to_string(workspace.tasks_path()).unwrap();
    assert_eq!(text.matches("Status: done").count(), 2);
}

#[test]
fn recall_sees_post_apply_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let workspace = propose_workspace(&dir);
    seed_contradicting_decisions(&workspace);

    let result = recall::recall(&workspace, "persistence", &RecallOptions::default()).unwrap();
    assert!(
        result
            .hits
            .iter()
            .any(|hit| hit.block_id.to_string() == "D-20260105-001")
    );

    let mut proposal = Proposal::new(
        "P-20260213-005".parse().unwrap(),
        Utc::now().date_naive(),
        ProposalType::Archive,
        Some("D-20260105-001".parse().unwrap()),
        "archive the loser".to_string(),
        "superseded in spirit".to_string(),
    )
    .unwrap();
    proposal.set_payload_field("NewStatus", "archived");
    workspace
        .write_file(
            &proposal.staged_path(),
            format!("# Proposed\n\n{}", proposal.to_block().to_markdown()).as_bytes(),
        )
        .unwrap();
    apply_proposal(&workspace, proposal.id(), "operator", false).unwrap();

    // The retrieval index rebuilds on the next call and active-only recall
    // no longer surfaces the archived decision.
    let after = recall::recall(&workspace, "persistence", &RecallOptions::default()).unwrap();
    assert!(
        after
            .hits
            .iter()
            .all(|hit| hit.block_id.to_string() != "D-20260105-001")
    );
}
