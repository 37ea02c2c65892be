//! Error types for the Mem-OS crate.
//!
//! This module defines a unified error enumeration used across block parsing,
//! the apply pipeline, WAL replay, locking, access control, and retrieval. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Pre-check variants (`AclDenied`, `PathTraversal`, `BudgetExceeded`,
//!   `LockTimeout`, `PreCheck`) are raised before any mutation; mid-apply
//!   variants always follow a snapshot rollback.
//! - Retrieval abstention is a normal result, never an error.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the Mem-OS library.
///
/// - Used across parsing, governance, durability and recall modules.
/// - Implements `std::error::Error` via `thiserror`.
pub enum MemError {
    /// Malformed or unsupported block identifier.
    #[error("The `{0}` is not a valid block id.")]
    InvalidBlockId(String),

    /// Invalid or unsupported block kind prefix.
    #[error("The `{0}` is not a valid block kind prefix.")]
    InvalidBlockKind(String),

    /// Status value outside the closed vocabulary of a kind.
    #[error("The `{status}` is not a valid status for {kind} blocks.")]
    InvalidStatus {
        /// Offending status literal.
        status: String,
        /// Kind whose vocabulary was violated.
        kind: String,
    },

    /// Malformed constraint signature record.
    #[error("Invalid constraint signature: {0}")]
    InvalidSignature(String),

    /// Malformed proposal block.
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    /// Referenced block does not exist in the workspace.
    #[error("Cannot find block `{0}` in the workspace")]
    BlockNotFound(String),

    /// Proposal pre-check rejected the mutation; nothing was written.
    #[error("Pre-check failed: {0}")]
    PreCheck(String),

    /// Post-apply validation failed; the mutation was rolled back.
    #[error("Validation failed after apply, rolled back: {0}")]
    Validation(String),

    /// Proposal budget for this run or day is exhausted.
    #[error("Proposal budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Workspace lock was not acquired within the deadline.
    #[error("Timed out after {0:?} waiting for the workspace lock")]
    LockTimeout(std::time::Duration),

    /// Agent lacks write access to a touched namespace.
    #[error("Agent `{agent}` is not authorized to write `{path}`")]
    AclDenied {
        /// Requesting agent id.
        agent: String,
        /// Path outside the agent's writable namespaces.
        path: PathBuf,
    },

    /// Resolved path escapes the workspace root.
    #[error("Path `{0}` resolves outside the workspace root")]
    PathTraversal(PathBuf),

    /// WAL replay found a journal/snapshot state it cannot reconcile.
    #[error("WAL replay conflict, operator action required: {0}")]
    WalReplayConflict(String),

    /// Attempted truncation or rewrite of an append-only daily log.
    #[error("Append-only violation on `{0}`: existing content is not a byte prefix of the new content")]
    AppendOnlyViolation(PathBuf),

    /// Per-day id counter rolled past 999.
    #[error("Id counter exhausted for prefix `{0}` on {1}")]
    CounterExhausted(String, String),

    /// Governance mode forbids the requested operation.
    #[error("Governance mode `{mode}` does not permit {operation}")]
    ModeForbidden {
        /// Current mode name.
        mode: String,
        /// Operation that was refused.
        operation: String,
    },

    /// Malformed or unsupported configuration file.
    #[error("The `{0}` is not a valid mem-os config: {1}")]
    InvalidConfig(PathBuf, String),

    /// Unsupported schema version on disk.
    #[error("Unsupported schema version `{0}`")]
    UnsupportedSchemaVersion(String),

    /// Malformed ACL file.
    #[error("The `{0}` is not a valid acl file: {1}")]
    InvalidAcl(PathBuf, String),

    /// Receipt missing from the audit trail or snapshot store.
    #[error("Cannot find receipt `{0}`")]
    ReceiptNotFound(String),

    /// Snapshot directory or manifest is missing or malformed.
    #[error("Invalid snapshot for receipt `{0}`: {1}")]
    InvalidSnapshot(String, String),

    /// I/O error from the underlying filesystem.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Invalid hash formatting or value.
    #[error("The `{0}` is not a valid content hash")]
    InvalidHashValue(String),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl MemError {
    /// Display shorthand for pre-check rejections that never mutate state.
    pub fn is_pre_check(&self) -> bool {
        matches!(
            self,
            MemError::PreCheck(_)
                | MemError::BudgetExceeded(_)
                | MemError::LockTimeout(_)
                | MemError::AclDenied { .. }
                | MemError::PathTraversal(_)
                | MemError::ModeForbidden { .. }
        )
    }
}
