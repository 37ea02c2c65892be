//! Integrity engine: deterministic analyses over the parsed corpus.
//!
//! Five passes, each a pure function of the block set and the scan date:
//!
//! - **Contradiction**: pairs of active decisions whose hard constraint
//!   signatures disagree on one axis. Tie-break for the supersede candidate:
//!   higher priority wins, then more specific scope, then the newer date;
//!   the losing side is flagged.
//! - **Drift**: axis-shaped decisions mentioned in daily logs with no
//!   active formal decision on that axis.
//! - **Dead**: active decisions past the age threshold with zero inbound
//!   references.
//! - **Orphan**: tasks whose `AlignsWith` does not resolve to an active
//!   decision.
//! - **Impact**: the directed graph from decisions to the blocks that
//!   reference them.
//!
//! Scan results are written to the `intelligence/` report files. In
//! `propose`/`enforce` modes the engine stages one proposal per issue under
//! the configured budget; deferred `(target, action)` pairs are suppressed
//! for the cooldown window.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::PathBuf,
};

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::proposal::{Proposal, ProposalStatus, ProposalType};
use crate::{
    block::{Block, BlockId, BlockKind, parser},
    errors::MemError,
    utils::atomic_write,
    workspace::Workspace,
};

/// Cue that a daily-log line records an informal decision.
static DRIFT_CUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(decided|decision|chose|switched to|agreed)\b").expect("cue"));

/// A dotted axis key embedded in free text.
static AXIS_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9_]*(?:\.[a-z0-9_]+)+\b").expect("axis token"));

/// One detected contradiction between two active decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contradiction {
    pub axis_key: String,
    pub left: BlockId,
    pub right: BlockId,
    /// The losing side of the tie-break, suggested for supersession.
    pub supersede_candidate: BlockId,
}

/// An informal decision in the logs with no formal counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub axis_key: String,
    pub file: PathBuf,
    pub line: usize,
    pub excerpt: String,
}

/// Result of one scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub contradictions: Vec<Contradiction>,
    pub drifts: Vec<Drift>,
    pub dead: Vec<BlockId>,
    /// `(task, unresolved target)` pairs.
    pub orphans: Vec<(BlockId, BlockId)>,
    /// Decision id → blocks referencing it.
    pub impact: BTreeMap<BlockId, Vec<BlockId>>,
    /// Proposals staged by this scan.
    pub staged: Vec<BlockId>,
}

/// Scanner state persisted at `memory/intel-state.json`: per-day budget
/// counters and the deferred-proposal suppression list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<DateTime<Utc>>,
    pub day: NaiveDate,
    #[serde(default)]
    pub proposals_today: u32,
    #[serde(default)]
    pub applies_today: u32,
    #[serde(default)]
    pub deferred: Vec<DeferredEntry>,
}

/// A deferred `(target, action)` pair and when it was deferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub target: String,
    pub action: String,
    pub deferred_on: NaiveDate,
}

impl IntelState {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            last_scan: None,
            day,
            proposals_today: 0,
            applies_today: 0,
            deferred: Vec::new(),
        }
    }

    /// Load the state, rolling the per-day counters when the day changed.
    pub fn load(workspace: &Workspace, today: NaiveDate) -> Result<Self, MemError> {
        let path = workspace.intel_state_path();
        let mut state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| Self::fresh(today)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::fresh(today),
            Err(err) => return Err(err.into()),
        };
        if state.day != today {
            state.day = today;
            state.proposals_today = 0;
            state.applies_today = 0;
        }
        Ok(state)
    }

    pub fn save(&self, workspace: &Workspace) -> Result<(), MemError> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        atomic_write(&workspace.intel_state_path(), &bytes)
    }

    /// Whether a `(target, action)` pair is still inside the deferral
    /// cooldown.
    pub fn is_deferred(
        &self,
        target: &str,
        action: &str,
        today: NaiveDate,
        cooldown_days: u32,
    ) -> bool {
        self.deferred.iter().any(|entry| {
            entry.target == target
                && entry.action == action
                && (today - entry.deferred_on).num_days() < cooldown_days as i64
        })
    }

    /// Record a deferral.
    pub fn defer(&mut self, target: String, action: String, today: NaiveDate) {
        self.deferred.retain(|entry| {
            !(entry.target == target && entry.action == action)
        });
        self.deferred.push(DeferredEntry {
            target,
            action,
            deferred_on: today,
        });
    }
}

/// Run all five passes and write the report files. Staging only happens in
/// `propose`/`enforce` mode and within budget.
pub fn scan(workspace: &Workspace) -> Result<ScanReport, MemError> {
    let _guard = workspace.lock()?;
    let today = Utc::now().date_naive();
    let (blocks, _diagnostics) = workspace.parse_corpus()?;

    let mut report = analyze(&blocks, today, workspace.config().dead_threshold_days);
    write_reports(workspace, &report, today)?;

    let mut state = IntelState::load(workspace, today)?;
    if workspace.mode().allows_proposals() {
        stage_proposals(workspace, &blocks, &mut report, &mut state, today)?;
    } else {
        debug!(mode = %workspace.mode(), "proposal generation disabled");
    }
    state.last_scan = Some(Utc::now());
    state.save(workspace)?;

    let scan_line = format!(
        "- {} contradictions={} drift={} dead={} orphans={} staged={}\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        report.contradictions.len(),
        report.drifts.len(),
        report.dead.len(),
        report.orphans.len(),
        report.staged.len(),
    );
    append_line(&workspace.scan_log_path(), &scan_line)?;
    info!(
        contradictions = report.contradictions.len(),
        drift = report.drifts.len(),
        dead = report.dead.len(),
        orphans = report.orphans.len(),
        staged = report.staged.len(),
        "scan complete"
    );
    Ok(report)
}

/// The pure analysis core, separated from IO for testability.
pub fn analyze(blocks: &[Block], today: NaiveDate, dead_threshold_days: u32) -> ScanReport {
    let mut report = ScanReport::default();

    report.contradictions = find_contradictions(blocks);
    report.drifts = find_drift(blocks);
    report.impact = build_impact(blocks);

    // Dead: active decisions past the age threshold with no inbound edges.
    for block in blocks {
        if block.kind() != BlockKind::Decision || !block.is_active() {
            continue;
        }
        let old_enough = block
            .date()
            .map(|date| (today - date).num_days() >= dead_threshold_days as i64)
            .unwrap_or(false);
        let referenced = report
            .impact
            .get(block.id())
            .is_some_and(|referrers| !referrers.is_empty());
        if old_enough && !referenced {
            report.dead.push(block.id().clone());
        }
    }

    // Orphans: tasks aligned with something that is not an active decision.
    for block in blocks {
        if block.kind() != BlockKind::Task {
            continue;
        }
        let Some(target) = block.aligns_with() else {
            continue;
        };
        let resolves = blocks.iter().any(|candidate| {
            candidate.id() == &target
                && candidate.kind() == BlockKind::Decision
                && candidate.is_active()
        });
        if !resolves {
            report.orphans.push((block.id().clone(), target));
        }
    }

    report
}

fn find_contradictions(blocks: &[Block]) -> Vec<Contradiction> {
    let decisions: Vec<&Block> = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Decision && block.is_active())
        .collect();

    let mut found = Vec::new();
    for (index, left) in decisions.iter().enumerate() {
        for right in &decisions[index + 1..] {
            for left_sig in left.signatures() {
                for right_sig in right.signatures() {
                    if !left_sig.contradicts(right_sig) {
                        continue;
                    }
                    let left_rank = (
                        left_sig.priority().unwrap_or(0),
                        left_sig.scope().map(|s| s.specificity()).unwrap_or(0),
                        left.date().unwrap_or(NaiveDate::MIN),
                    );
                    let right_rank = (
                        right_sig.priority().unwrap_or(0),
                        right_sig.scope().map(|s| s.specificity()).unwrap_or(0),
                        right.date().unwrap_or(NaiveDate::MIN),
                    );
                    let candidate = if left_rank >= right_rank {
                        right.id().clone()
                    } else {
                        left.id().clone()
                    };
                    found.push(Contradiction {
                        axis_key: left_sig.axis_key().to_string(),
                        left: left.id().clone(),
                        right: right.id().clone(),
                        supersede_candidate: candidate,
                    });
                }
            }
        }
    }
    // One record per decision pair and axis.
    found.dedup_by(|a, b| a.axis_key == b.axis_key && a.left == b.left && a.right == b.right);
    found
}

fn find_drift(blocks: &[Block]) -> Vec<Drift> {
    let active_axes: HashSet<&str> = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Decision && block.is_active())
        .flat_map(|block| block.signatures().iter().map(|sig| sig.axis_key()))
        .collect();

    let mut drifts = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for block in blocks {
        if block.kind() != BlockKind::Session && !is_daily_log_file(block.source_file()) {
            continue;
        }
        let (start, _) = block.line_range();
        for (offset, line) in block.body().lines().enumerate() {
            if !DRIFT_CUE.is_match(line) {
                continue;
            }
            for axis in AXIS_TOKEN.find_iter(line) {
                let axis_key = axis.as_str().to_string();
                if active_axes.contains(axis_key.as_str()) || !seen.insert(axis_key.clone()) {
                    continue;
                }
                drifts.push(Drift {
                    axis_key,
                    file: block.source_file().to_path_buf(),
                    line: start + offset,
                    excerpt: line.trim().to_string(),
                });
            }
        }
    }
    drifts
}

fn is_daily_log_file(path: &std::path::Path) -> bool {
    path.starts_with("memory")
        && path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").is_ok())
}

fn build_impact(blocks: &[Block]) -> BTreeMap<BlockId, Vec<BlockId>> {
    let decision_ids: HashSet<&BlockId> = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Decision)
        .map(|block| block.id())
        .collect();

    let mut impact: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
    for decision in &decision_ids {
        impact.insert((*decision).clone(), Vec::new());
    }
    for block in blocks {
        for reference in block.references() {
            if decision_ids.contains(&reference) {
                impact.entry(reference).or_default().push(block.id().clone());
            }
        }
    }
    for referrers in impact.values_mut() {
        referrers.sort();
        referrers.dedup();
    }
    impact
}

fn write_reports(
    workspace: &Workspace,
    report: &ScanReport,
    today: NaiveDate,
) -> Result<(), MemError> {
    // CONTRADICTIONS.md: one C block per finding.
    let mut contradictions = String::from("# Contradictions\n");
    for (index, finding) in report.contradictions.iter().enumerate() {
        let id = BlockId::new(BlockKind::Contradiction, Some(today), index as u32 + 1)?;
        contradictions.push_str(&format!(
            "\n## [{id}]\nDate: {}\nAxis: {}\nLeft: {}\nRight: {}\nSupersedeCandidate: {}\n",
            today.format("%Y-%m-%d"),
            finding.axis_key,
            finding.left,
            finding.right,
            finding.supersede_candidate,
        ));
    }
    workspace.write_file(
        &PathBuf::from("intelligence/CONTRADICTIONS.md"),
        contradictions.as_bytes(),
    )?;

    // DRIFT.md: one DREF block per informal decision.
    let mut drift = String::from("# Drift\n");
    for (index, finding) in report.drifts.iter().enumerate() {
        let id = BlockId::new(BlockKind::DriftRef, Some(today), index as u32 + 1)?;
        drift.push_str(&format!(
            "\n## [{id}]\nDate: {}\nAxis: {}\nSource: {}:{}\nExcerpt: {}\n",
            today.format("%Y-%m-%d"),
            finding.axis_key,
            finding.file.display(),
            finding.line,
            finding.excerpt,
        ));
    }
    workspace.write_file(&PathBuf::from("intelligence/DRIFT.md"), drift.as_bytes())?;

    // IMPACT.md: the adjacency map.
    let mut impact = String::from("# Impact\n\n");
    for (decision, referrers) in &report.impact {
        let list = if referrers.is_empty() {
            "(none)".to_string()
        } else {
            referrers
                .iter()
                .map(BlockId::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        impact.push_str(&format!("- {decision} <- {list}\n"));
    }
    workspace.write_file(&PathBuf::from("intelligence/IMPACT.md"), impact.as_bytes())?;

    // SIGNALS.md: append dead/orphan findings not already recorded.
    let signals_path = workspace.signals_path();
    let existing_text = fs::read_to_string(&signals_path).unwrap_or_default();
    let existing = parser::parse_str(&existing_text, &PathBuf::from("intelligence/SIGNALS.md"));
    let recorded: HashSet<String> = existing
        .blocks
        .iter()
        .filter_map(|block| block.field("Target").map(str::to_string))
        .collect();
    let mut next_seq = next_seq_for(&existing.blocks, BlockKind::Signal, today);

    let mut appended = String::new();
    for dead in &report.dead {
        if recorded.contains(&dead.to_string()) {
            continue;
        }
        let id = BlockId::new(BlockKind::Signal, Some(today), next_seq)?;
        next_seq += 1;
        appended.push_str(&format!(
            "\n## [{id}]\nDate: {}\nSummary: decision {dead} has no inbound references\nKind: dead\nTarget: {dead}\n",
            today.format("%Y-%m-%d"),
        ));
    }
    for (task, target) in &report.orphans {
        if recorded.contains(&task.to_string()) {
            continue;
        }
        let id = BlockId::new(BlockKind::Signal, Some(today), next_seq)?;
        next_seq += 1;
        appended.push_str(&format!(
            "\n## [{id}]\nDate: {}\nSummary: task {task} aligns with {target} which is not an active decision\nKind: orphan\nTarget: {task}\n",
            today.format("%Y-%m-%d"),
        ));
    }
    if !appended.is_empty() {
        let mut content = if existing_text.is_empty() {
            String::from("# Signals\n")
        } else {
            existing_text
        };
        content.push_str(&appended);
        workspace.write_file(&PathBuf::from("intelligence/SIGNALS.md"), content.as_bytes())?;
    }
    Ok(())
}

pub(crate) fn next_seq_for(blocks: &[Block], kind: BlockKind, date: NaiveDate) -> u32 {
    blocks
        .iter()
        .filter(|block| block.kind() == kind && block.id().date() == Some(date))
        .map(|block| block.id().seq())
        .max()
        .map(|seq| seq + 1)
        .unwrap_or(1)
}

fn stage_proposals(
    workspace: &Workspace,
    blocks: &[Block],
    report: &mut ScanReport,
    state: &mut IntelState,
    today: NaiveDate,
) -> Result<(), MemError> {
    let budget = &workspace.config().proposal_budget;
    let cooldown = workspace.config().defer_cooldown_days;

    let pending: Vec<Proposal> = blocks
        .iter()
        .filter(|block| block.kind() == BlockKind::Proposal)
        .filter_map(|block| Proposal::from_block(block).ok())
        .collect();
    let pending_keys: HashSet<(String, String)> = pending
        .iter()
        .filter(|proposal| proposal.status() == ProposalStatus::Pending)
        .map(Proposal::dedupe_key)
        .collect();
    let mut backlog = pending_keys.len() as u32;
    let mut next_seq = next_seq_for(blocks, BlockKind::Proposal, today);
    let mut staged_this_run: u32 = 0;
    let mut staged_keys: HashSet<(String, String)> = HashSet::new();

    // One candidate proposal per issue, contradictions first.
    let mut candidates: Vec<(ProposalType, Option<BlockId>, String, String, Vec<(String, String)>)> =
        Vec::new();
    for finding in &report.contradictions {
        let winner = if finding.supersede_candidate == finding.left {
            &finding.right
        } else {
            &finding.left
        };
        candidates.push((
            ProposalType::Merge,
            Some(finding.supersede_candidate.clone()),
            format!("supersede in favor of {winner}"),
            format!("hard contradiction on {}", finding.axis_key),
            vec![("Into".to_string(), winner.to_string())],
        ));
    }
    for dead in &report.dead {
        candidates.push((
            ProposalType::Archive,
            Some(dead.clone()),
            "archive dead decision".to_string(),
            "no inbound references for the configured threshold".to_string(),
            Vec::new(),
        ));
    }
    for (task, target) in &report.orphans {
        candidates.push((
            ProposalType::StatusChange,
            Some(task.clone()),
            "mark blocked".to_string(),
            format!("aligned decision {target} is missing or inactive"),
            vec![("NewStatus".to_string(), "blocked".to_string())],
        ));
    }
    for drift in &report.drifts {
        candidates.push((
            ProposalType::NewDecision,
            None,
            format!("promote informal decision on {}", drift.axis_key),
            format!("seen in {}:{}", drift.file.display(), drift.line),
            vec![
                ("Statement".to_string(), drift.excerpt.clone()),
                ("Axis".to_string(), drift.axis_key.clone()),
            ],
        ));
    }

    for (proposal_type, target, action, reason, payload) in candidates {
        if staged_this_run >= budget.per_run {
            debug!("per-run proposal budget reached");
            break;
        }
        if state.proposals_today >= budget.per_day {
            debug!("per-day proposal budget reached");
            break;
        }
        if backlog >= budget.backlog_limit {
            debug!("proposal backlog limit reached");
            break;
        }
        let target_key = target
            .as_ref()
            .map(BlockId::to_string)
            .unwrap_or_else(|| "-".to_string());
        let key = (target_key.clone(), action.clone());
        if pending_keys.contains(&key) || staged_keys.contains(&key) {
            continue;
        }
        if state.is_deferred(&target_key, &action, today, cooldown) {
            debug!(target = %target_key, action = %action, "suppressed by deferral cooldown");
            continue;
        }

        let id = BlockId::new(BlockKind::Proposal, Some(today), next_seq)?;
        next_seq += 1;
        let mut proposal = Proposal::new(id, today, proposal_type, target, action, reason)?;
        for (k, v) in payload {
            proposal.set_payload_field(k, v);
        }
        let staged_path = proposal.staged_path();
        let content = format!("# Proposed\n\n{}", proposal.to_block().to_markdown());
        workspace.write_file(&staged_path, content.as_bytes())?;

        staged_keys.insert(key);
        report.staged.push(proposal.id().clone());
        staged_this_run += 1;
        state.proposals_today += 1;
        backlog += 1;
    }
    Ok(())
}

fn append_line(path: &std::path::Path, line: &str) -> Result<(), MemError> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Record an externally submitted signal. Writes to `SIGNALS.md` only and
/// returns the new signal block's id.
pub fn submit_signal(workspace: &Workspace, summary: &str) -> Result<BlockId, MemError> {
    let _guard = workspace.lock()?;
    let today = Utc::now().date_naive();
    let path = workspace.signals_path();
    let existing_text = fs::read_to_string(&path).unwrap_or_default();
    let existing = parser::parse_str(&existing_text, &PathBuf::from("intelligence/SIGNALS.md"));
    let seq = next_seq_for(&existing.blocks, BlockKind::Signal, today);
    let id = BlockId::new(BlockKind::Signal, Some(today), seq)?;

    let mut content = if existing_text.is_empty() {
        String::from("# Signals\n")
    } else {
        existing_text
    };
    content.push_str(&format!(
        "\n## [{id}]\nDate: {}\nSummary: {}\nKind: submitted\n",
        today.format("%Y-%m-%d"),
        summary.trim(),
    ));
    workspace.write_file(&PathBuf::from("intelligence/SIGNALS.md"), content.as_bytes())?;
    Ok(id)
}

/// Parse the current contradiction report.
pub fn list_contradictions(workspace: &Workspace) -> Result<Vec<Contradiction>, MemError> {
    let path = workspace.contradictions_path();
    let text = fs::read_to_string(&path).unwrap_or_default();
    let outcome = parser::parse_str(&text, &PathBuf::from("intelligence/CONTRADICTIONS.md"));
    let mut found = Vec::new();
    for block in &outcome.blocks {
        let field = |key: &str| {
            block.field(key).ok_or_else(|| {
                MemError::Validation(format!("{} is missing `{key}`", block.id()))
            })
        };
        found.push(Contradiction {
            axis_key: field("Axis")?.to_string(),
            left: field("Left")?.parse()?,
            right: field("Right")?.parse()?,
            supersede_candidate: field("SupersedeCandidate")?.parse()?,
        });
    }
    Ok(found)
}
