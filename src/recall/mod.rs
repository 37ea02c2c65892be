//! Retrieval core facade.
//!
//! [`recall`] is a pure function of the current corpus bytes and the
//! configuration: it classifies the query, lazily (re)builds the epoch-keyed
//! index, runs the BM25F pipeline, and maps ranked chunks to [`Hit`]s
//! filtered by the caller's read ACL. [`check_abstention`] gates the packed
//! result set before any downstream answerer runs.

pub mod abstain;
pub mod index;
pub mod query;
pub mod score;
pub mod stem;

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{block::BlockId, block::BlockKind, errors::MemError, workspace::Workspace};
pub use abstain::{AbstentionFeatures, AbstentionVerdict};
pub use index::{CachedIndex, CorpusIndex, FieldTag};
pub use query::{QueryAnalysis, QueryClass};
pub use score::HitOrigin;

/// Graph-boost switch. `Auto` enables it for multi-hop queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphMode {
    #[default]
    Auto,
    On,
    Off,
}

/// Options for one recall call.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub limit: usize,
    pub active_only: bool,
    /// Restricts results to namespaces this agent may read.
    pub agent_id: Option<String>,
    pub graph: GraphMode,
    /// Best-effort deadline; on expiry current results return with
    /// `truncated = true`.
    pub deadline: Option<Duration>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            active_only: true,
            agent_id: None,
            graph: GraphMode::Auto,
            deadline: None,
        }
    }
}

/// One retrieval result.
#[derive(Debug, Clone)]
pub struct Hit {
    pub block_id: BlockId,
    pub kind: BlockKind,
    pub score: f64,
    pub field: FieldTag,
    pub excerpt: String,
    pub speaker: Option<String>,
    pub source_file: PathBuf,
    pub line_range: (usize, usize),
    pub origin: HitOrigin,
}

/// The ranked hits plus query metadata.
#[derive(Debug, Clone)]
pub struct RecallResult {
    pub hits: Vec<Hit>,
    pub class: QueryClass,
    pub truncated: bool,
}

/// Rank block-aligned chunks for a natural-language query.
pub fn recall(
    workspace: &Workspace,
    query_text: &str,
    options: &RecallOptions,
) -> Result<RecallResult, MemError> {
    let analysis = query::analyze(query_text);
    let index = current_index(workspace)?;

    let graph_enabled = match options.graph {
        GraphMode::On => true,
        GraphMode::Off => false,
        GraphMode::Auto => analysis.class.multi_hop,
    };
    let deadline = options.deadline.map(|budget| Instant::now() + budget);

    let outcome = score::search(
        &index,
        &analysis,
        options.limit,
        options.active_only,
        graph_enabled,
        Utc::now().date_naive(),
        deadline,
    );

    let mut hits = Vec::with_capacity(outcome.ranked.len());
    for scored in &outcome.ranked {
        let chunk = &index.chunks[scored.chunk];
        if let Some(agent) = &options.agent_id {
            if !workspace.acl().can_read(agent, &chunk.source_file) {
                continue;
            }
        }
        hits.push(Hit {
            block_id: chunk.block_id.clone(),
            kind: chunk.kind,
            score: scored.score,
            field: chunk.field,
            excerpt: chunk.text.clone(),
            speaker: chunk.speaker.clone(),
            source_file: chunk.source_file.clone(),
            line_range: chunk.line_range,
            origin: scored.origin,
        });
    }

    Ok(RecallResult {
        hits,
        class: analysis.class,
        truncated: outcome.truncated,
    })
}

/// Gate the hits through the abstention classifier using the configured
/// threshold.
pub fn check_abstention(
    workspace: &Workspace,
    query_text: &str,
    hits: &[Hit],
) -> AbstentionVerdict {
    let analysis = query::analyze(query_text);
    abstain::check(&analysis, hits, workspace.config().abstention.threshold)
}

/// Return the index for the current corpus epoch, rebuilding when any
/// corpus file changed since the cached build.
fn current_index(workspace: &Workspace) -> Result<Arc<CorpusIndex>, MemError> {
    let epoch = workspace.epoch()?;
    let mut cache = workspace
        .recall_cache
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    if let Some(cached) = cache.as_ref() {
        if cached.epoch == epoch {
            return Ok(Arc::clone(&cached.index));
        }
    }
    tracing::debug!(epoch, "rebuilding retrieval index");
    let (blocks, _diagnostics) = workspace.parse_corpus()?;
    let index = Arc::new(CorpusIndex::build(&blocks));
    *cache = Some(CachedIndex {
        epoch,
        index: Arc::clone(&index),
    });
    Ok(index)
}
