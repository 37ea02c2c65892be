//! Markdown block parser.
//!
//! Tokenizes UTF-8 markdown into typed blocks. A block starts at a header
//! line `[ID]` (optionally prefixed by one or two `#`), followed by
//! `Key: Value` field lines until a blank line or the next header. A line
//! `ConstraintSignatures:` introduces a 2-space-indented `- key: value`
//! record list terminated by dedent. Text after the first blank line is the
//! block body.
//!
//! The parser never fails on content: malformed ids drop the block with a
//! recorded diagnostic and parsing continues. Same bytes always produce the
//! same blocks.

use std::{
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Block, BlockId, ConstraintSignature};
use crate::errors::MemError;

static HEADER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:#{1,2}\s*)?\[([^\[\]]+)\]\s*$").expect("header pattern"));

static FIELD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_.-]*):(?:\s(.*))?$").expect("field pattern"));

static SIGNATURE_ITEM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^  - ([A-Za-z][A-Za-z0-9_.-]*):\s*(.*)$").expect("signature item pattern")
});

static SIGNATURE_CONT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^    ([A-Za-z][A-Za-z0-9_.-]*):\s*(.*)$").expect("signature cont pattern")
});

/// A recorded, non-fatal parse problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    /// File the problem was found in.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// Human-readable description.
    pub message: String,
}

/// Result of parsing one file: ordered blocks plus diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// Blocks in file order, each carrying its line span.
    pub blocks: Vec<Block>,
    /// Non-fatal problems encountered along the way.
    pub diagnostics: Vec<ParseDiagnostic>,
}

enum Section {
    Fields,
    Signatures,
    Body,
}

struct Builder {
    block: Block,
    start_line: usize,
    last_content_line: usize,
    section: Section,
    pending_pairs: Vec<(String, String)>,
    pending_line: usize,
    body_lines: Vec<String>,
}

/// Parse a file from disk.
pub fn parse_path(path: &Path) -> Result<ParseOutcome, MemError> {
    let text = fs::read_to_string(path)?;
    Ok(parse_str(&text, path))
}

/// Parse an in-memory buffer, attributing spans and diagnostics to `source`.
pub fn parse_str(text: &str, source: &Path) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut builder: Option<Builder> = None;
    // Lines after a dropped (malformed-id) header are skipped up to the next
    // header.
    let mut skipping = false;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;

        if let Some(captures) = HEADER_PATTERN.captures(line) {
            finalize(&mut builder, source, &mut outcome);
            skipping = false;
            match captures[1].parse::<BlockId>() {
                Ok(id) => {
                    builder = Some(Builder {
                        block: Block::new(id, source.to_path_buf()),
                        start_line: line_no,
                        last_content_line: line_no,
                        section: Section::Fields,
                        pending_pairs: Vec::new(),
                        pending_line: line_no,
                        body_lines: Vec::new(),
                    });
                }
                Err(_) => {
                    outcome.diagnostics.push(ParseDiagnostic {
                        file: source.to_path_buf(),
                        line: line_no,
                        message: format!("malformed block id `{}`, block dropped", &captures[1]),
                    });
                    skipping = true;
                }
            }
            continue;
        }

        if skipping {
            continue;
        }
        let Some(current) = builder.as_mut() else {
            continue;
        };
        if !line.trim().is_empty() {
            current.last_content_line = line_no;
        }

        match current.section {
            Section::Fields => {
                if line.trim().is_empty() {
                    current.section = Section::Body;
                } else if line == "ConstraintSignatures:" {
                    current.section = Section::Signatures;
                } else if let Some(captures) = FIELD_PATTERN.captures(line) {
                    let key = captures[1].to_string();
                    let value = captures
                        .get(2)
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default();
                    if current.block.field(&key).is_some() {
                        tracing::warn!(
                            file = %source.display(),
                            line = line_no,
                            key,
                            "duplicate field key, keeping first value"
                        );
                    } else {
                        current.block.push_field(key, value);
                    }
                } else {
                    // Not a field line: treat as the start of the body.
                    current.section = Section::Body;
                    current.body_lines.push(line.to_string());
                }
            }
            Section::Signatures => {
                if let Some(captures) = SIGNATURE_ITEM_PATTERN.captures(line) {
                    flush_signature(current, source, &mut outcome.diagnostics);
                    current.pending_line = line_no;
                    current
                        .pending_pairs
                        .push((captures[1].to_string(), captures[2].trim().to_string()));
                } else if let Some(captures) = SIGNATURE_CONT_PATTERN.captures(line) {
                    current
                        .pending_pairs
                        .push((captures[1].to_string(), captures[2].trim().to_string()));
                } else {
                    // Dedent terminates the list; the line is reinterpreted.
                    flush_signature(current, source, &mut outcome.diagnostics);
                    if line.trim().is_empty() {
                        current.section = Section::Body;
                    } else if let Some(captures) = FIELD_PATTERN.captures(line) {
                        current.section = Section::Fields;
                        let key = captures[1].to_string();
                        let value = captures
                            .get(2)
                            .map(|m| m.as_str().trim().to_string())
                            .unwrap_or_default();
                        current.block.push_field(key, value);
                    } else {
                        current.section = Section::Body;
                        current.body_lines.push(line.to_string());
                    }
                }
            }
            Section::Body => {
                current.body_lines.push(line.to_string());
            }
        }
    }
    finalize(&mut builder, source, &mut outcome);
    outcome
}

fn flush_signature(
    builder: &mut Builder,
    source: &Path,
    diagnostics: &mut Vec<ParseDiagnostic>,
) {
    if builder.pending_pairs.is_empty() {
        return;
    }
    let pairs = std::mem::take(&mut builder.pending_pairs);
    match ConstraintSignature::from_pairs(&pairs) {
        Ok(signature) => builder.block.push_signature(signature),
        Err(err) => diagnostics.push(ParseDiagnostic {
            file: source.to_path_buf(),
            line: builder.pending_line,
            message: format!("constraint signature skipped: {err}"),
        }),
    }
}

fn finalize(builder: &mut Option<Builder>, source: &Path, outcome: &mut ParseOutcome) {
    let Some(mut current) = builder.take() else {
        return;
    };
    flush_signature(&mut current, source, &mut outcome.diagnostics);

    // Trim trailing blank lines off the body but keep interior structure.
    while current
        .body_lines
        .last()
        .is_some_and(|line| line.trim().is_empty())
    {
        current.body_lines.pop();
    }
    // Leading blanks are separator artifacts, not body content.
    while current
        .body_lines
        .first()
        .is_some_and(|line| line.trim().is_empty())
    {
        current.body_lines.remove(0);
    }
    if !current.body_lines.is_empty() {
        current.block.set_body(current.body_lines.join("\n"));
    }
    current.block.set_location(
        source.to_path_buf(),
        (current.start_line, current.last_content_line),
    );
    outcome.blocks.push(current.block);
}
