//! Structural validator.
//!
//! A pure function of the parsed block set: no side effects, no IO, and
//! byte-identical output across back-to-back runs on an unchanged corpus.
//! Each finding carries a stable check id, a severity, the offending
//! file/line, and a suggested remediation in the message.

use std::{collections::HashMap, fmt, path::PathBuf};

use crate::block::{Block, BlockKind, ParseDiagnostic};

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Fail,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

/// One validator finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Stable identifier, e.g. `V-DUP-ID`.
    pub check_id: &'static str,
    pub severity: Severity,
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}:{} {}",
            self.check_id,
            self.severity,
            self.file.display(),
            self.line,
            self.message
        )
    }
}

/// Run every structural check over the parsed corpus.
pub fn validate(blocks: &[Block], diagnostics: &[ParseDiagnostic]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for diagnostic in diagnostics {
        issues.push(ValidationIssue {
            check_id: "V-PARSE",
            severity: Severity::Warn,
            file: diagnostic.file.clone(),
            line: diagnostic.line,
            message: format!("{}; fix the block header or field syntax", diagnostic.message),
        });
    }

    // Id uniqueness: exactly one block declares each id.
    let mut first_seen: HashMap<&crate::block::BlockId, &Block> = HashMap::new();
    for block in blocks {
        if let Some(original) = first_seen.get(block.id()) {
            issues.push(ValidationIssue {
                check_id: "V-DUP-ID",
                severity: Severity::Fail,
                file: block.source_file().to_path_buf(),
                line: block.line_range().0,
                message: format!(
                    "id {} already declared at {}:{}; allocate a fresh id",
                    block.id(),
                    original.source_file().display(),
                    original.line_range().0
                ),
            });
        } else {
            first_seen.insert(block.id(), block);
        }
    }

    for block in blocks {
        let (start, _) = block.line_range();
        let at = |check_id, severity, message| ValidationIssue {
            check_id,
            severity,
            file: block.source_file().to_path_buf(),
            line: start,
            message,
        };

        for key in block.kind().required_fields() {
            if block.field(key).is_none() {
                issues.push(at(
                    "V-REQ-FIELD",
                    Severity::Fail,
                    format!(
                        "{} is missing required field `{key}`; add the field",
                        block.id()
                    ),
                ));
            }
        }

        if let (Some(vocabulary), Some(status)) =
            (block.kind().status_values(), block.status())
        {
            if !vocabulary.contains(&status) {
                issues.push(at(
                    "V-STATUS",
                    Severity::Fail,
                    format!(
                        "{} has status `{status}`, expected one of {}",
                        block.id(),
                        vocabulary.join("/")
                    ),
                ));
            }
        }

        if let Some(field) = block.field("SupersededBy") {
            match field.parse::<crate::block::BlockId>() {
                Ok(successor) => match first_seen.get(&successor) {
                    Some(_) if successor.kind() == block.kind() => {
                        if block.status() != Some("superseded") {
                            issues.push(at(
                                "V-SUPERSEDE-STATUS",
                                Severity::Warn,
                                format!(
                                    "{} carries SupersededBy but status is not `superseded`",
                                    block.id()
                                ),
                            ));
                        }
                    }
                    Some(_) => issues.push(at(
                        "V-SUPERSEDE-REF",
                        Severity::Fail,
                        format!(
                            "{} SupersededBy target {successor} is a {} block, expected {}",
                            block.id(),
                            successor.kind(),
                            block.kind()
                        ),
                    )),
                    None => issues.push(at(
                        "V-SUPERSEDE-REF",
                        Severity::Fail,
                        format!(
                            "{} SupersededBy target {successor} does not exist; restore it or fix the reference",
                            block.id()
                        ),
                    )),
                },
                Err(_) => issues.push(at(
                    "V-SUPERSEDE-REF",
                    Severity::Fail,
                    format!("{} SupersededBy `{field}` is not a valid id", block.id()),
                )),
            }
        }

        if block.kind() == BlockKind::Task {
            if let Some(field) = block.field("AlignsWith") {
                match field.parse::<crate::block::BlockId>() {
                    Ok(target) if target.kind() == BlockKind::Decision => {
                        if !first_seen.contains_key(&target) {
                            issues.push(at(
                                "V-ALIGN-REF",
                                Severity::Fail,
                                format!(
                                    "{} AlignsWith target {target} does not exist; point it at a real decision",
                                    block.id()
                                ),
                            ));
                        }
                    }
                    Ok(target) => issues.push(at(
                        "V-ALIGN-REF",
                        Severity::Fail,
                        format!(
                            "{} AlignsWith target {target} is not a decision",
                            block.id()
                        ),
                    )),
                    Err(_) => issues.push(at(
                        "V-ALIGN-REF",
                        Severity::Fail,
                        format!("{} AlignsWith `{field}` is not a valid id", block.id()),
                    )),
                }
            }
        }

        if !block.signatures().is_empty() && block.kind() != BlockKind::Decision {
            issues.push(at(
                "V-SIG-KIND",
                Severity::Warn,
                format!(
                    "{} carries constraint signatures but is a {} block",
                    block.id(),
                    block.kind()
                ),
            ));
        }
    }

    issues.sort_by(|a, b| {
        (&a.file, a.line, a.check_id).cmp(&(&b.file, b.line, b.check_id))
    });
    issues
}

/// Only `fail`-severity findings, the set that blocks an apply.
pub fn failures(issues: &[ValidationIssue]) -> Vec<&ValidationIssue> {
    issues
        .iter()
        .filter(|issue| issue.severity == Severity::Fail)
        .collect()
}
