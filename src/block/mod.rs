//! Block model definitions: typed markdown records with key/value fields and
//! the supporting id, signature, and parser modules.
//!
//! A workspace is a set of markdown files; each file carries zero or more
//! blocks. A block starts at a header line `[ID]`, is followed by `Key: Value`
//! fields, an optional `ConstraintSignatures:` list (decisions only), and an
//! optional free-text body after the first blank line.
//!
//! Blocks are append-oriented: after activation a block is never edited in
//! place. Supersession writes a successor block and flips the predecessor's
//! `Status` to `superseded` with a back-reference; archival is a status flip
//! to `archived`; physical removal happens only through compaction.

pub mod id;
pub mod parser;
pub mod signature;

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::MemError;
pub use id::{BlockId, BlockKind};
pub use parser::{ParseDiagnostic, ParseOutcome};
pub use signature::{ConstraintSignature, Enforcement, Modality, Relation, Scope, SignatureObject};

/// Matches embedded block-id references inside field values and body text.
static ID_REF_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:DREF|TOOL|PRJ|PER|INC|SIG|D|T|C|P|I|B|S)-(?:\d{8}-)?\d{3}\b")
        .expect("reference pattern is valid")
});

/// A typed, IDed markdown record.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    id: BlockId,
    source_file: PathBuf,
    /// 1-based inclusive line span within the source file.
    line_range: (usize, usize),
    fields: IndexMap<String, String>,
    signatures: Vec<ConstraintSignature>,
    body: String,
}

impl Block {
    /// Create a new in-memory block. The source file and span are assigned
    /// when the block is parsed back from disk; freshly built blocks carry
    /// the file they are destined for and an empty span.
    pub fn new(id: BlockId, destined_for: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source_file: destined_for.into(),
            line_range: (0, 0),
            fields: IndexMap::new(),
            signatures: Vec::new(),
            body: String::new(),
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.id.kind()
    }

    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    pub fn line_range(&self) -> (usize, usize) {
        self.line_range
    }

    pub(crate) fn set_location(&mut self, file: PathBuf, range: (usize, usize)) {
        self.source_file = file;
        self.line_range = range;
    }

    /// Field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    /// Insert a field, preserving insertion order. A duplicate key keeps the
    /// first value, mirroring the parser contract.
    pub fn push_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.fields.contains_key(&key) {
            tracing::warn!(block = %self.id, key, "duplicate field key, keeping first value");
            return;
        }
        self.fields.insert(key, value.into());
    }

    pub fn signatures(&self) -> &[ConstraintSignature] {
        &self.signatures
    }

    pub fn push_signature(&mut self, signature: ConstraintSignature) {
        self.signatures.push(signature);
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// The `Status` field, if the kind carries one.
    pub fn status(&self) -> Option<&str> {
        self.field("Status")
    }

    /// Whether this block is still live: not superseded and not archived.
    /// For decisions this coincides with `Status: active`; kinds without a
    /// status vocabulary are always live.
    pub fn is_active(&self) -> bool {
        match self.status() {
            Some(status) => !matches!(status, "superseded" | "archived"),
            None => true,
        }
    }

    /// Parsed `Date` field.
    pub fn date(&self) -> Option<NaiveDate> {
        self.field("Date")
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    }

    /// `AlignsWith` target for tasks.
    pub fn aligns_with(&self) -> Option<BlockId> {
        self.field("AlignsWith").and_then(|raw| raw.parse().ok())
    }

    /// `SupersededBy` back-reference.
    pub fn superseded_by(&self) -> Option<BlockId> {
        self.field("SupersededBy").and_then(|raw| raw.parse().ok())
    }

    /// Every block id mentioned anywhere in this block's fields or body,
    /// excluding its own id. Cross-references are looked up, never owned.
    pub fn references(&self) -> Vec<BlockId> {
        let mut seen = Vec::new();
        let mut scan = |text: &str| {
            for found in ID_REF_PATTERN.find_iter(text) {
                if let Ok(id) = found.as_str().parse::<BlockId>() {
                    if id != self.id && !seen.contains(&id) {
                        seen.push(id);
                    }
                }
            }
        };
        for value in self.fields.values() {
            scan(value);
        }
        scan(&self.body);
        seen
    }

    /// Check required fields and status vocabulary for this block's kind.
    pub fn check_required(&self) -> Result<(), MemError> {
        for key in self.kind().required_fields() {
            if self.field(key).is_none() {
                return Err(MemError::Validation(format!(
                    "{} is missing required field `{key}`",
                    self.id
                )));
            }
        }
        if let (Some(vocabulary), Some(status)) = (self.kind().status_values(), self.status()) {
            if !vocabulary.contains(&status) {
                return Err(MemError::InvalidStatus {
                    status: status.to_string(),
                    kind: self.kind().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Canonical markdown form. `parse(serialize(blocks)) == blocks` up to
    /// preserved field ordering.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## [{}]\n", self.id);
        for (key, value) in &self.fields {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        if !self.signatures.is_empty() {
            out.push_str("ConstraintSignatures:\n");
            for signature in &self.signatures {
                out.push_str(&signature.to_markdown());
            }
        }
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let id: BlockId = "D-20260101-001".parse().unwrap();
        let mut block = Block::new(id, "decisions/DECISIONS.md");
        block.push_field("Date", "2026-01-01");
        block.push_field("Status", "active");
        block.push_field("Statement", "Use PostgreSQL for persistence");
        block
    }

    #[test]
    fn test_required_fields_enforced() {
        let block = sample_block();
        assert!(block.check_required().is_ok());

        let id: BlockId = "D-20260101-002".parse().unwrap();
        let mut incomplete = Block::new(id, "decisions/DECISIONS.md");
        incomplete.push_field("Date", "2026-01-01");
        assert!(incomplete.check_required().is_err());
    }

    #[test]
    fn test_status_vocabulary_enforced() {
        let id: BlockId = "D-20260101-003".parse().unwrap();
        let mut block = Block::new(id, "decisions/DECISIONS.md");
        block.push_field("Date", "2026-01-01");
        block.push_field("Status", "living");
        block.push_field("Statement", "Bad status");
        assert!(matches!(
            block.check_required(),
            Err(MemError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_duplicate_field_keeps_first() {
        let mut block = sample_block();
        block.push_field("Status", "superseded");
        assert_eq!(block.status(), Some("active"));
    }

    #[test]
    fn test_reference_extraction() {
        let mut block = sample_block();
        block.push_field("Supersedes", "D-20251201-004");
        block.set_body("Relates to T-20260102-001 and PRJ-001; see also T-20260102-001.");

        let refs = block.references();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&"D-20251201-004".parse().unwrap()));
        assert!(refs.contains(&"T-20260102-001".parse().unwrap()));
        assert!(refs.contains(&"PRJ-001".parse().unwrap()));
    }

    #[test]
    fn test_markdown_shape() {
        let mut block = sample_block();
        block.push_signature(
            ConstraintSignature::new(
                "database.engine",
                Relation::MustBe,
                SignatureObject::Scalar("postgresql".into()),
                Enforcement::Hard,
                "db",
            )
            .unwrap(),
        );
        let text = block.to_markdown();
        assert!(text.starts_with("## [D-20260101-001]\n"));
        assert!(text.contains("Statement: Use PostgreSQL for persistence\n"));
        assert!(text.contains("ConstraintSignatures:\n  - axis.key: database.engine\n"));
    }
}
