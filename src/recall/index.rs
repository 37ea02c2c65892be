//! Retrieval index: block-aligned chunks, inverted postings, bigrams, and
//! the cross-reference adjacency used by graph boost.
//!
//! Every block is cut into field chunks (one per tagged field) plus
//! overlapping 3-sentence body windows with stride 2. Chunks are the unit of
//! scoring; each one knows its field tag, its block, and its provenance.
//! The index is rebuilt lazily whenever the corpus epoch moves.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use super::stem::tokenize;
use crate::block::{Block, BlockId, BlockKind};

/// Window size and stride for body chunking.
const WINDOW: usize = 3;
const STRIDE: usize = 2;

static SPEAKER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?\s*(?:\d{1,2}:\d{2}\s+)?([A-Z][a-z]+):\s").expect("speaker pattern")
});

/// Origin tag of a chunk's text, with its BM25F weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldTag {
    Statement,
    Title,
    Name,
    Summary,
    Body,
    Tags,
    Context,
    Date,
}

impl FieldTag {
    /// BM25F field weight.
    pub fn weight(&self) -> f64 {
        match self {
            FieldTag::Statement => 3.0,
            FieldTag::Title => 2.5,
            FieldTag::Name => 2.0,
            FieldTag::Summary => 1.5,
            FieldTag::Body => 1.0,
            FieldTag::Tags => 0.8,
            FieldTag::Context => 0.5,
            FieldTag::Date => 1.0,
        }
    }

    fn for_key(key: &str) -> FieldTag {
        match key {
            "Statement" => FieldTag::Statement,
            "Title" => FieldTag::Title,
            "Name" => FieldTag::Name,
            "Summary" => FieldTag::Summary,
            "Tags" => FieldTag::Tags,
            "Date" => FieldTag::Date,
            _ => FieldTag::Context,
        }
    }
}

/// One scoring unit.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub block_id: BlockId,
    pub kind: BlockKind,
    pub field: FieldTag,
    pub text: String,
    pub tokens: Vec<String>,
    pub source_file: PathBuf,
    pub line_range: (usize, usize),
    pub date: Option<NaiveDate>,
    pub active: bool,
    /// Utterance speaker, when the chunk is a log line with one.
    pub speaker: Option<String>,
    /// Position of this chunk within its block's chunk list.
    pub seq_in_block: usize,
}

/// The inverted index over one corpus snapshot.
#[derive(Debug, Default)]
pub struct CorpusIndex {
    pub chunks: Vec<Chunk>,
    /// term -> (chunk index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    /// adjacent stemmed pair -> chunk indices containing it
    bigrams: HashMap<(String, String), HashSet<usize>>,
    /// average token length per field tag
    avg_len: HashMap<FieldTag, f64>,
    /// block id -> indices of its chunks, in order
    pub block_chunks: HashMap<BlockId, Vec<usize>>,
    /// undirected cross-reference neighbors
    pub adjacency: HashMap<BlockId, Vec<BlockId>>,
}

/// An epoch-stamped index held in the workspace context.
pub struct CachedIndex {
    pub epoch: u64,
    pub index: Arc<CorpusIndex>,
}

impl CorpusIndex {
    /// Build the index over a parsed corpus.
    pub fn build(blocks: &[Block]) -> Self {
        let mut index = CorpusIndex::default();

        for block in blocks {
            let date = block.date();
            let active = block.is_active();
            let mut seq = 0usize;
            let mut push_chunk = |index: &mut CorpusIndex,
                                  field: FieldTag,
                                  text: String,
                                  speaker: Option<String>,
                                  seq: &mut usize| {
                let tokens = tokenize(&text);
                if tokens.is_empty() {
                    return;
                }
                let chunk_id = index.chunks.len();
                for window in tokens.windows(2) {
                    index
                        .bigrams
                        .entry((window[0].clone(), window[1].clone()))
                        .or_default()
                        .insert(chunk_id);
                }
                let mut counts: HashMap<&str, u32> = HashMap::new();
                for token in &tokens {
                    *counts.entry(token.as_str()).or_default() += 1;
                }
                for (term, tf) in counts {
                    index
                        .postings
                        .entry(term.to_string())
                        .or_default()
                        .push((chunk_id, tf));
                }
                index.chunks.push(Chunk {
                    block_id: block.id().clone(),
                    kind: block.kind(),
                    field,
                    text,
                    tokens,
                    source_file: block.source_file().to_path_buf(),
                    line_range: block.line_range(),
                    date,
                    active,
                    speaker,
                    seq_in_block: *seq,
                });
                index
                    .block_chunks
                    .entry(block.id().clone())
                    .or_default()
                    .push(chunk_id);
                *seq += 1;
            };

            for (key, value) in block.fields() {
                if value.trim().is_empty() {
                    continue;
                }
                push_chunk(
                    &mut index,
                    FieldTag::for_key(key),
                    value.clone(),
                    None,
                    &mut seq,
                );
            }

            let sentences = split_sentences(block.body());
            if !sentences.is_empty() {
                let mut start = 0;
                loop {
                    let end = (start + WINDOW).min(sentences.len());
                    let window = &sentences[start..end];
                    let text = window.join(" ");
                    let speaker = window.first().and_then(|first| {
                        SPEAKER_PATTERN
                            .captures(first)
                            .map(|captures| captures[1].to_lowercase())
                    });
                    push_chunk(&mut index, FieldTag::Body, text, speaker, &mut seq);
                    if end == sentences.len() {
                        break;
                    }
                    start += STRIDE;
                }
            }

            // Cross-reference edges, recorded in both directions.
            for reference in block.references() {
                index
                    .adjacency
                    .entry(block.id().clone())
                    .or_default()
                    .push(reference.clone());
                index
                    .adjacency
                    .entry(reference)
                    .or_default()
                    .push(block.id().clone());
            }
        }

        for neighbors in index.adjacency.values_mut() {
            neighbors.sort();
            neighbors.dedup();
        }

        let mut totals: HashMap<FieldTag, (usize, usize)> = HashMap::new();
        for chunk in &index.chunks {
            let entry = totals.entry(chunk.field).or_default();
            entry.0 += chunk.tokens.len();
            entry.1 += 1;
        }
        index.avg_len = totals
            .into_iter()
            .map(|(field, (tokens, count))| (field, tokens as f64 / count as f64))
            .collect();
        index
    }

    /// Postings for a term.
    pub fn postings(&self, term: &str) -> &[(usize, u32)] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chunks containing an adjacent pair.
    pub fn bigram_chunks(&self, pair: &(String, String)) -> Option<&HashSet<usize>> {
        self.bigrams.get(pair)
    }

    /// BM25 inverse document frequency over chunks.
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.chunks.len() as f64;
        let df = self.postings(term).len() as f64;
        (((n - df + 0.5) / (df + 0.5)) + 1.0).ln()
    }

    /// Average token count for a field tag.
    pub fn avg_len(&self, field: FieldTag) -> f64 {
        self.avg_len.get(&field).copied().unwrap_or(1.0).max(1.0)
    }

    /// 1-hop neighbors of a block.
    pub fn neighbors(&self, block: &BlockId) -> &[BlockId] {
        self.adjacency
            .get(block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Sentence splitter used for body windows: hard breaks at newlines, soft
/// breaks after `.`, `!`, `?` followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut chars = trimmed.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|next| next.is_whitespace())
            {
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
        let tail = current.trim().to_string();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }
    sentences
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::block::parser::parse_str;

    fn corpus() -> Vec<Block> {
        let decisions = "\
## [D-20260101-001]
Date: 2026-01-01
Status: active
Statement: Use OAuth2 for login
Tags: authentication security

First raised in the platform sync. Benchmarks sealed it. Rollout was staged over two weeks. Nobody objected.
";
        let logs = "\
## [S-20260210-001]
Date: 2026-02-10

- 10:00 Alice: approved the migration plan. It ships Friday.
";
        let mut blocks = parse_str(decisions, Path::new("decisions/DECISIONS.md")).blocks;
        blocks.extend(parse_str(logs, Path::new("memory/2026-02-10.md")).blocks);
        blocks
    }

    #[test]
    fn test_field_chunks_carry_tags() {
        let blocks = corpus();
        let index = CorpusIndex::build(&blocks);

        let statement = index
            .chunks
            .iter()
            .find(|chunk| chunk.field == FieldTag::Statement)
            .unwrap();
        assert!(statement.text.contains("OAuth2"));
        let tags = index
            .chunks
            .iter()
            .find(|chunk| chunk.field == FieldTag::Tags)
            .unwrap();
        let stemmed_auth = crate::recall::stem::stem("authentication");
        assert!(tags.tokens.contains(&stemmed_auth));
    }

    #[test]
    fn test_body_windows_overlap() {
        let blocks = corpus();
        let index = CorpusIndex::build(&blocks);
        let body_chunks: Vec<&Chunk> = index
            .chunks
            .iter()
            .filter(|chunk| {
                chunk.field == FieldTag::Body && chunk.block_id.to_string() == "D-20260101-001"
            })
            .collect();
        // Four sentences, window 3 stride 2: [0..3] and [2..4].
        assert_eq!(body_chunks.len(), 2);
        assert!(body_chunks[0].text.contains("Benchmarks"));
        assert!(body_chunks[1].text.contains("Rollout"));
    }

    #[test]
    fn test_postings_and_idf() {
        let blocks = corpus();
        let index = CorpusIndex::build(&blocks);
        assert!(!index.postings("login").is_empty());
        // A term in every chunk has lower idf than a rare one.
        assert!(index.idf("login") > 0.0);
        assert!(index.idf("zzzmissing") > index.idf("login"));
    }

    #[test]
    fn test_speaker_extraction() {
        let blocks = corpus();
        let index = CorpusIndex::build(&blocks);
        let utterance = index
            .chunks
            .iter()
            .find(|chunk| chunk.speaker.is_some())
            .unwrap();
        assert_eq!(utterance.speaker.as_deref(), Some("alice"));
    }

    #[test]
    fn test_adjacency_is_bidirectional() {
        let text = "\
## [D-20260101-001]
Date: 2026-01-01
Status: active
Statement: Base decision

## [T-20260102-001]
Date: 2026-01-02
Status: open
Title: Follow-up
AlignsWith: D-20260101-001
";
        let blocks = parse_str(text, Path::new("x.md")).blocks;
        let index = CorpusIndex::build(&blocks);
        let decision: BlockId = "D-20260101-001".parse().unwrap();
        let task: BlockId = "T-20260102-001".parse().unwrap();
        assert!(index.neighbors(&decision).contains(&task));
        assert!(index.neighbors(&task).contains(&decision));
    }

    #[test]
    fn test_sentence_splitter() {
        let sentences = split_sentences("One. Two two. Three!\nFour");
        assert_eq!(sentences, vec!["One.", "Two two.", "Three!", "Four"]);
    }
}
