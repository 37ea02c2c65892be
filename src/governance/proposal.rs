//! Proposals: staged, reviewable mutations.
//!
//! A proposal is itself a block (`P` prefix) staged under
//! `intelligence/proposed/<id>_PROPOSED.md`. The apply engine consumes it,
//! executing exactly one mutation per apply. Payload fields beyond the
//! required set (`Statement` for a new decision, `NewStatus` for a status
//! change, ...) ride along as ordinary block fields.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::NaiveDate;
use indexmap::IndexMap;

use crate::{
    block::{Block, BlockId, BlockKind},
    errors::MemError,
};

/// The mutation a proposal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalType {
    NewDecision,
    NewTask,
    Supersede,
    StatusChange,
    Merge,
    Archive,
}

impl ProposalType {
    /// Low-risk types may be auto-applied in `enforce` mode. Supersession
    /// and merging always require an operator.
    pub fn is_low_risk(&self) -> bool {
        matches!(self, ProposalType::StatusChange | ProposalType::Archive)
    }

    /// Whether this type requires an existing target block.
    pub fn needs_target(&self) -> bool {
        !matches!(self, ProposalType::NewDecision | ProposalType::NewTask)
    }
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalType::NewDecision => "new_decision",
            ProposalType::NewTask => "new_task",
            ProposalType::Supersede => "supersede",
            ProposalType::StatusChange => "status_change",
            ProposalType::Merge => "merge",
            ProposalType::Archive => "archive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProposalType {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_decision" => Ok(ProposalType::NewDecision),
            "new_task" => Ok(ProposalType::NewTask),
            "supersede" => Ok(ProposalType::Supersede),
            "status_change" => Ok(ProposalType::StatusChange),
            "merge" => Ok(ProposalType::Merge),
            "archive" => Ok(ProposalType::Archive),
            _ => Err(MemError::InvalidProposal(format!("unknown type `{s}`"))),
        }
    }
}

/// Proposal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
    Deferred,
    Failed,
}

impl ProposalStatus {
    /// Statuses the apply engine accepts as input.
    pub fn is_applicable(&self) -> bool {
        matches!(self, ProposalStatus::Pending | ProposalStatus::Approved)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Deferred => "deferred",
            ProposalStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProposalStatus {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "applied" => Ok(ProposalStatus::Applied),
            "rejected" => Ok(ProposalStatus::Rejected),
            "deferred" => Ok(ProposalStatus::Deferred),
            "failed" => Ok(ProposalStatus::Failed),
            _ => Err(MemError::InvalidProposal(format!("unknown status `{s}`"))),
        }
    }
}

/// A staged mutation parsed from (or destined for) a proposal block.
#[derive(Debug, Clone)]
pub struct Proposal {
    id: BlockId,
    date: NaiveDate,
    status: ProposalStatus,
    proposal_type: ProposalType,
    target: Option<BlockId>,
    action: String,
    reason: String,
    /// Payload fields beyond the required set, in block order.
    payload: IndexMap<String, String>,
}

impl Proposal {
    pub fn new(
        id: BlockId,
        date: NaiveDate,
        proposal_type: ProposalType,
        target: Option<BlockId>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, MemError> {
        if id.kind() != BlockKind::Proposal {
            return Err(MemError::InvalidProposal(format!(
                "`{id}` is not a P-prefixed id"
            )));
        }
        if proposal_type.needs_target() && target.is_none() {
            return Err(MemError::InvalidProposal(format!(
                "`{proposal_type}` proposals require a target"
            )));
        }
        Ok(Self {
            id,
            date,
            status: ProposalStatus::Pending,
            proposal_type,
            target,
            action: action.into(),
            reason: reason.into(),
            payload: IndexMap::new(),
        })
    }

    /// Reconstruct a proposal from its staged block.
    pub fn from_block(block: &Block) -> Result<Self, MemError> {
        if block.kind() != BlockKind::Proposal {
            return Err(MemError::InvalidProposal(format!(
                "`{}` is not a proposal block",
                block.id()
            )));
        }
        let required = |key: &str| {
            block.field(key).ok_or_else(|| {
                MemError::InvalidProposal(format!("{} is missing `{key}`", block.id()))
            })
        };

        let date = NaiveDate::parse_from_str(required("Date")?, "%Y-%m-%d")
            .map_err(|_| MemError::InvalidProposal(format!("{} has a bad Date", block.id())))?;
        let proposal_type: ProposalType = required("Type")?.parse()?;
        let status: ProposalStatus = required("Status")?.parse()?;
        let target = match block.field("Target") {
            Some("-") | None => None,
            Some(raw) => Some(
                raw.parse::<BlockId>()
                    .map_err(|_| {
                        MemError::InvalidProposal(format!(
                            "{} Target `{raw}` is not a valid id",
                            block.id()
                        ))
                    })?,
            ),
        };
        if proposal_type.needs_target() && target.is_none() {
            return Err(MemError::InvalidProposal(format!(
                "{} is a `{proposal_type}` proposal without a Target",
                block.id()
            )));
        }

        let mut payload = IndexMap::new();
        for (key, value) in block.fields() {
            if !matches!(
                key.as_str(),
                "Date" | "Status" | "Type" | "Target" | "Action" | "Reason"
            ) {
                payload.insert(key.clone(), value.clone());
            }
        }

        Ok(Self {
            id: block.id().clone(),
            date,
            status,
            proposal_type,
            target,
            action: required("Action")?.to_string(),
            reason: required("Reason")?.to_string(),
            payload,
        })
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn status(&self) -> ProposalStatus {
        self.status
    }

    pub fn proposal_type(&self) -> ProposalType {
        self.proposal_type
    }

    pub fn target(&self) -> Option<&BlockId> {
        self.target.as_ref()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn payload(&self) -> &IndexMap<String, String> {
        &self.payload
    }

    pub fn payload_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    pub fn set_payload_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.payload.insert(key.into(), value.into());
    }

    /// Duplicate-suppression key: proposals with equal keys stage the same
    /// mutation.
    pub fn dedupe_key(&self) -> (String, String) {
        (
            self.target
                .as_ref()
                .map(BlockId::to_string)
                .unwrap_or_else(|| "-".to_string()),
            self.action.clone(),
        )
    }

    /// Relative path of the staged proposal file.
    pub fn staged_path(&self) -> PathBuf {
        PathBuf::from("intelligence/proposed").join(format!("{}_PROPOSED.md", self.id))
    }

    /// Materialize as a block for staging.
    pub fn to_block(&self) -> Block {
        let mut block = Block::new(self.id.clone(), self.staged_path());
        block.push_field("Date", self.date.format("%Y-%m-%d").to_string());
        block.push_field("Status", self.status.to_string());
        block.push_field("Type", self.proposal_type.to_string());
        block.push_field(
            "Target",
            self.target
                .as_ref()
                .map(BlockId::to_string)
                .unwrap_or_else(|| "-".to_string()),
        );
        block.push_field("Action", self.action.clone());
        block.push_field("Reason", self.reason.clone());
        for (key, value) in &self.payload {
            block.push_field(key.clone(), value.clone());
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::block::parser::parse_str;

    fn proposal() -> Proposal {
        let mut proposal = Proposal::new(
            "P-20260213-001".parse().unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(),
            ProposalType::Supersede,
            Some("D-20260101-001".parse().unwrap()),
            "supersede with a mysql decision",
            "hard contradiction on database.engine",
        )
        .unwrap();
        proposal.set_payload_field("Statement", "Use MySQL for persistence");
        proposal
    }

    #[test]
    fn test_block_round_trip() {
        let original = proposal();
        let markdown = original.to_block().to_markdown();
        let outcome = parse_str(&markdown, Path::new("intelligence/proposed/x.md"));
        let parsed = Proposal::from_block(&outcome.blocks[0]).unwrap();

        assert_eq!(parsed.id(), original.id());
        assert_eq!(parsed.proposal_type(), ProposalType::Supersede);
        assert_eq!(parsed.status(), ProposalStatus::Pending);
        assert_eq!(parsed.target(), original.target());
        assert_eq!(
            parsed.payload_field("Statement"),
            Some("Use MySQL for persistence")
        );
    }

    #[test]
    fn test_target_required_by_type() {
        let missing = Proposal::new(
            "P-20260213-002".parse().unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(),
            ProposalType::Archive,
            None,
            "archive",
            "dead decision",
        );
        assert!(matches!(missing, Err(MemError::InvalidProposal(_))));

        let fine = Proposal::new(
            "P-20260213-003".parse().unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(),
            ProposalType::NewTask,
            None,
            "create follow-up task",
            "drift promotion",
        );
        assert!(fine.is_ok());
    }

    #[test]
    fn test_low_risk_classification() {
        assert!(ProposalType::StatusChange.is_low_risk());
        assert!(ProposalType::Archive.is_low_risk());
        assert!(!ProposalType::Supersede.is_low_risk());
        assert!(!ProposalType::Merge.is_low_risk());
    }

    #[test]
    fn test_dedupe_key() {
        let a = proposal();
        let mut b = proposal();
        b.set_payload_field("Extra", "irrelevant");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }
}
