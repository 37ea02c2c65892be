//! Ranking pipeline: BM25F scoring, wide retrieval, five-signal rerank,
//! graph boost, and append-only context packing.
//!
//! Scores flow through four stages. Wide retrieval takes the top 200 chunks
//! by BM25F; the rerank stage normalizes those scores and adds the five
//! bounded signals; graph boost surfaces cross-reference neighbors at 0.3x
//! (1-hop) and 0.1x (2-hop); context packing appends supporting chunks
//! without ever reordering what ranked above them.

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use chrono::NaiveDate;

use super::{
    index::{CorpusIndex, FieldTag},
    query::QueryAnalysis,
};

/// BM25 saturation constant.
pub const K1: f64 = 1.2;
/// BM25 length normalization constant.
pub const B: f64 = 0.75;
/// Wide-retrieval pool size before rerank.
pub const WIDE_POOL: usize = 200;
/// Date-field multiplier for temporal queries.
const TEMPORAL_DATE_BOOST: f64 = 2.0;
/// Recency half-life denominator, in days.
const RECENCY_SCALE: f64 = 180.0;

/// Where a ranked chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOrigin {
    Bm25,
    Graph,
}

/// One ranked chunk.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: usize,
    pub score: f64,
    pub origin: HitOrigin,
}

/// Final ranking plus the deadline flag.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub ranked: Vec<ScoredChunk>,
    pub truncated: bool,
}

/// Run the full pipeline.
pub fn search(
    index: &CorpusIndex,
    analysis: &QueryAnalysis,
    limit: usize,
    active_only: bool,
    graph_enabled: bool,
    today: NaiveDate,
    deadline: Option<Instant>,
) -> SearchOutcome {
    let expired = |deadline: Option<Instant>| {
        deadline.is_some_and(|deadline| Instant::now() >= deadline)
    };

    let scores = bm25f(index, analysis, active_only, today);
    let mut pool: Vec<(usize, f64)> = scores.into_iter().collect();
    pool.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    pool.truncate(WIDE_POOL);

    if expired(deadline) {
        return SearchOutcome {
            ranked: pool
                .into_iter()
                .take(limit)
                .map(|(chunk, score)| ScoredChunk {
                    chunk,
                    score,
                    origin: HitOrigin::Bm25,
                })
                .collect(),
            truncated: true,
        };
    }

    // --- rerank -----------------------------------------------------------

    let max_score = pool.first().map(|(_, score)| *score).unwrap_or(1.0).max(f64::MIN_POSITIVE);
    let mut ranked: Vec<ScoredChunk> = pool
        .iter()
        .map(|&(chunk_id, score)| {
            let signals = rerank_signals(index, analysis, chunk_id, today);
            ScoredChunk {
                chunk: chunk_id,
                score: score / max_score + signals,
                origin: HitOrigin::Bm25,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.cmp(&b.chunk)));

    // --- graph boost ------------------------------------------------------

    if graph_enabled && !expired(deadline) {
        let present_blocks: HashSet<_> = ranked
            .iter()
            .map(|scored| index.chunks[scored.chunk].block_id.clone())
            .collect();
        let sources: Vec<ScoredChunk> = ranked.iter().take(limit).cloned().collect();
        let mut added: HashSet<usize> = HashSet::new();

        for source in &sources {
            let source_block = &index.chunks[source.chunk].block_id;
            for (hop_factor, hops) in [(0.3, 1), (0.1, 2)] {
                for neighbor in neighbors_at(index, source_block, hops) {
                    if present_blocks.contains(&neighbor) {
                        continue;
                    }
                    let Some(chunk_ids) = index.block_chunks.get(&neighbor) else {
                        continue;
                    };
                    // Surface the neighbor's most informative chunk.
                    let Some(&best) = chunk_ids
                        .iter()
                        .max_by(|a, b| {
                            index.chunks[**a]
                                .field
                                .weight()
                                .total_cmp(&index.chunks[**b].field.weight())
                        })
                    else {
                        continue;
                    };
                    if active_only && !index.chunks[best].active {
                        continue;
                    }
                    if added.insert(best) {
                        ranked.push(ScoredChunk {
                            chunk: best,
                            score: source.score * hop_factor,
                            origin: HitOrigin::Graph,
                        });
                    }
                }
            }
        }
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.cmp(&b.chunk)));
    }

    let overflow: Vec<ScoredChunk> = ranked.iter().skip(limit).cloned().collect();
    ranked.truncate(limit);

    // --- context packing (append-only) -----------------------------------

    pack_context(index, analysis, &mut ranked, &overflow);

    SearchOutcome {
        ranked,
        truncated: false,
    }
}

/// Raw BM25F over the expansion set, with the bigram phrase bonus and the
/// temporal adjustments applied.
pub(crate) fn bm25f(
    index: &CorpusIndex,
    analysis: &QueryAnalysis,
    active_only: bool,
    today: NaiveDate,
) -> HashMap<usize, f64> {
    let mut scores: HashMap<usize, f64> = HashMap::new();
    let mut term_scores: HashMap<(usize, String), f64> = HashMap::new();
    for term in &analysis.expanded {
        let idf = index.idf(term);
        for &(chunk_id, tf) in index.postings(term) {
            let chunk = &index.chunks[chunk_id];
            if active_only && !chunk.active {
                continue;
            }
            let mut weight = chunk.field.weight();
            if analysis.class.temporal && chunk.field == FieldTag::Date {
                weight *= TEMPORAL_DATE_BOOST;
            }
            let tf = tf as f64;
            let length_norm =
                K1 * (1.0 - B + B * chunk.tokens.len() as f64 / index.avg_len(chunk.field));
            let score = idf * weight * tf * (K1 + 1.0) / (tf + length_norm);
            *scores.entry(chunk_id).or_default() += score;
            term_scores.insert((chunk_id, term.clone()), score);
        }
    }

    // Bigram phrase bonus: +25% of the pair's base term score per adjacent
    // pair present in the chunk.
    for pair in &analysis.bigrams {
        let Some(chunk_ids) = index.bigram_chunks(pair) else {
            continue;
        };
        for &chunk_id in chunk_ids {
            if !scores.contains_key(&chunk_id) {
                continue;
            }
            let left = term_scores
                .get(&(chunk_id, pair.0.clone()))
                .copied()
                .unwrap_or(0.0);
            let right = term_scores
                .get(&(chunk_id, pair.1.clone()))
                .copied()
                .unwrap_or(0.0);
            *scores.entry(chunk_id).or_default() += 0.25 * 0.5 * (left + right);
        }
    }

    if analysis.class.temporal {
        for (&chunk_id, score) in scores.iter_mut() {
            if let Some(date) = index.chunks[chunk_id].date {
                let age = (today - date).num_days().max(0) as f64;
                *score *= (-age / RECENCY_SCALE).exp();
            }
        }
    }
    scores
}

/// Blocks exactly `hops` cross-reference steps away.
fn neighbors_at(
    index: &CorpusIndex,
    start: &crate::block::BlockId,
    hops: u8,
) -> Vec<crate::block::BlockId> {
    let one: Vec<_> = index.neighbors(start).to_vec();
    if hops == 1 {
        return one;
    }
    let direct: HashSet<_> = one.iter().cloned().collect();
    let mut two = Vec::new();
    for mid in &one {
        for far in index.neighbors(mid) {
            if far != start && !direct.contains(far) && !two.contains(far) {
                two.push(far.clone());
            }
        }
    }
    two
}

fn rerank_signals(
    index: &CorpusIndex,
    analysis: &QueryAnalysis,
    chunk_id: usize,
    today: NaiveDate,
) -> f64 {
    let chunk = &index.chunks[chunk_id];
    let text_lower = chunk.text.to_lowercase();
    let mut signals = 0.0;

    // speaker_match (+-0.15)
    if !analysis.names.is_empty() {
        let mentions_query_name = analysis
            .names
            .iter()
            .any(|name| text_lower.contains(name) || chunk.speaker.as_deref() == Some(name));
        if mentions_query_name {
            signals += 0.15;
        } else if chunk.speaker.is_some() {
            signals -= 0.15;
        }
    }

    // time_proximity (+-0.10)
    if let (Some(query_date), Some(chunk_date)) = (analysis.date, chunk.date) {
        let delta = (query_date - chunk_date).num_days().abs();
        if delta <= 7 {
            signals += 0.10;
        } else if delta > 90 {
            signals -= 0.10;
        }
    }

    // entity_overlap (0..0.20)
    if !analysis.names.is_empty() {
        let overlap = analysis
            .names
            .iter()
            .filter(|name| text_lower.contains(*name))
            .count() as f64;
        signals += 0.20 * overlap / analysis.names.len() as f64;
    }

    // bigram_coherence (0..0.15)
    if !analysis.bigrams.is_empty() {
        let present = analysis
            .bigrams
            .iter()
            .filter(|pair| {
                index
                    .bigram_chunks(pair)
                    .is_some_and(|chunks| chunks.contains(&chunk_id))
            })
            .count() as f64;
        signals += 0.15 * present / analysis.bigrams.len() as f64;
    }

    // recency_decay (0..0.10)
    if let Some(date) = chunk.date {
        let age = (today - date).num_days().max(0) as f64;
        signals += 0.10 * (-age / RECENCY_SCALE).exp();
    }

    signals
}

const LEADING_PRONOUNS: &[&str] = &["he", "she", "they", "it", "his", "her", "their", "its"];

fn pack_context(
    index: &CorpusIndex,
    analysis: &QueryAnalysis,
    ranked: &mut Vec<ScoredChunk>,
    overflow: &[ScoredChunk],
) {
    let mut present: HashSet<usize> = ranked.iter().map(|scored| scored.chunk).collect();
    let base: Vec<ScoredChunk> = ranked.clone();
    let mut append = |ranked: &mut Vec<ScoredChunk>,
                      present: &mut HashSet<usize>,
                      chunk_id: usize,
                      score: f64| {
        if present.insert(chunk_id) {
            ranked.push(ScoredChunk {
                chunk: chunk_id,
                score,
                origin: HitOrigin::Bm25,
            });
        }
    };

    // Dialog adjacency: an utterance pulls its neighboring utterances.
    for scored in &base {
        let chunk = &index.chunks[scored.chunk];
        if chunk.speaker.is_none() {
            continue;
        }
        if let Some(siblings) = index.block_chunks.get(&chunk.block_id) {
            let position = siblings.iter().position(|&c| c == scored.chunk);
            if let Some(position) = position {
                if position > 0 {
                    append(ranked, &mut present, siblings[position - 1], scored.score * 0.5);
                }
                if position + 1 < siblings.len() {
                    append(ranked, &mut present, siblings[position + 1], scored.score * 0.5);
                }
            }
        }
    }

    // Entity diversity: a single-entity result set pulls in the best chunk
    // mentioning any other queried entity.
    if analysis.names.len() >= 2 && !base.is_empty() {
        let covered: HashSet<&String> = analysis
            .names
            .iter()
            .filter(|name| {
                base.iter().any(|scored| {
                    index.chunks[scored.chunk].text.to_lowercase().contains(*name)
                })
            })
            .collect();
        if covered.len() == 1 {
            let missing: Vec<&String> = analysis
                .names
                .iter()
                .filter(|name| !covered.contains(name))
                .take(3)
                .collect();
            if let Some(extra) = overflow.iter().find(|scored| {
                let text = index.chunks[scored.chunk].text.to_lowercase();
                missing.iter().any(|name| text.contains(*name))
            }) {
                append(ranked, &mut present, extra.chunk, extra.score);
            }
        }
    }

    // Pronoun rescue: a chunk opening on a bare third-person pronoun pulls
    // the previous sentence window.
    for scored in &base {
        let chunk = &index.chunks[scored.chunk];
        let first_word = chunk
            .text
            .split_whitespace()
            .next()
            .map(|word| {
                word.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .unwrap_or_default();
        if !LEADING_PRONOUNS.contains(&first_word.as_str()) {
            continue;
        }
        if let Some(siblings) = index.block_chunks.get(&chunk.block_id) {
            if let Some(position) = siblings.iter().position(|&c| c == scored.chunk) {
                if position > 0 {
                    append(ranked, &mut present, siblings[position - 1], scored.score * 0.5);
                }
            }
        }
    }
}
