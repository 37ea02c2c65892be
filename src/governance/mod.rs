//! Governance: the mode machine, staged proposals, integrity analyses, the
//! structural validator, and the apply engine that mediates every mutation.

pub mod apply;
pub mod compaction;
pub mod integrity;
pub mod mode;
pub mod proposal;
pub mod validator;

pub use apply::{apply_proposal, auto_apply, rollback};
pub use compaction::{CompactionReport, compact};
pub use integrity::{Contradiction, Drift, IntelState, ScanReport, list_contradictions, scan, submit_signal};
pub use mode::{CleanEvidence, GovernanceMode};
pub use proposal::{Proposal, ProposalStatus, ProposalType};
pub use validator::{Severity, ValidationIssue, validate};
