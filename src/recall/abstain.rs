//! Abstention classifier: the pre-answer gate.
//!
//! Computes evidence features over the final packed hit set and combines
//! them linearly. Below the configured threshold (default 0.20) the caller
//! receives `abstain = true` and must return the "insufficient evidence"
//! sentinel instead of invoking any downstream answerer. Abstention is a
//! normal result, never an error.

use serde::Serialize;

use super::{Hit, query::QueryAnalysis, stem};

/// Feature weights of the linear combination. Tunable, fixed here.
const W_ENTITY_OVERLAP: f64 = 0.30;
const W_MAX_SCORE: f64 = 0.25;
const W_SPEAKER_COVERAGE: f64 = 0.15;
const W_EVIDENCE_DENSITY: f64 = 0.15;
const W_NEGATION_ASYMMETRY: f64 = 0.25;

/// The computed evidence features, surfaced alongside the verdict.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AbstentionFeatures {
    /// Fraction of query entities (or content terms) covered by the hits.
    pub entity_overlap: f64,
    /// Top hit score, squashed into [0, 1].
    pub max_score: f64,
    /// Fraction of queried names that appear as evidence speakers.
    pub speaker_coverage: f64,
    /// Mean non-stopword ratio of the hit texts.
    pub evidence_density: f64,
    /// Distance between the query's negation polarity and the evidence's.
    pub negation_asymmetry: f64,
}

/// The gate's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AbstentionVerdict {
    pub confidence: f64,
    pub abstain: bool,
    pub features: AbstentionFeatures,
}

/// Compute features over the packed hit set and gate on `threshold`.
pub fn check(analysis: &QueryAnalysis, hits: &[Hit], threshold: f64) -> AbstentionVerdict {
    let features = compute_features(analysis, hits);
    let confidence = (W_ENTITY_OVERLAP * features.entity_overlap
        + W_MAX_SCORE * features.max_score
        + W_SPEAKER_COVERAGE * features.speaker_coverage
        + W_EVIDENCE_DENSITY * features.evidence_density
        - W_NEGATION_ASYMMETRY * features.negation_asymmetry)
        .clamp(0.0, 1.0);
    AbstentionVerdict {
        confidence,
        abstain: confidence < threshold,
        features,
    }
}

fn compute_features(analysis: &QueryAnalysis, hits: &[Hit]) -> AbstentionFeatures {
    if hits.is_empty() {
        return AbstentionFeatures {
            entity_overlap: 0.0,
            max_score: 0.0,
            speaker_coverage: 0.0,
            evidence_density: 0.0,
            negation_asymmetry: if analysis.negated { 1.0 } else { 0.0 },
        };
    }

    let texts_lower: Vec<String> = hits.iter().map(|hit| hit.excerpt.to_lowercase()).collect();

    // Entity overlap: named entities when the query has any, content terms
    // otherwise.
    let probes: Vec<&String> = if analysis.names.is_empty() {
        analysis.expanded.iter().collect()
    } else {
        analysis.names.iter().collect()
    };
    let entity_overlap = if probes.is_empty() {
        1.0
    } else {
        let covered = probes
            .iter()
            .filter(|probe| texts_lower.iter().any(|text| text.contains(probe.as_str())))
            .count();
        covered as f64 / probes.len() as f64
    };

    let max_score = hits
        .iter()
        .map(|hit| hit.score)
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0);

    let speaker_coverage = if analysis.names.is_empty() {
        1.0
    } else {
        let covered = analysis
            .names
            .iter()
            .filter(|name| {
                hits.iter()
                    .any(|hit| hit.speaker.as_deref() == Some(name.as_str()))
            })
            .count();
        covered as f64 / analysis.names.len() as f64
    };

    let evidence_density = {
        let mut content = 0usize;
        let mut total = 0usize;
        for hit in hits {
            for token in stem::raw_tokens(&hit.excerpt) {
                total += 1;
                if !stem::is_stopword(&token) {
                    content += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            content as f64 / total as f64
        }
    };

    let evidence_negated = texts_lower
        .iter()
        .filter(|text| {
            stem::raw_tokens(text).iter().any(|token| {
                matches!(token.as_str(), "not" | "never" | "didn" | "wasn" | "don" | "doesn")
            })
        })
        .count() as f64
        / hits.len() as f64;
    let query_polarity = if analysis.negated { 1.0 } else { 0.0 };
    let negation_asymmetry = (query_polarity - evidence_negated).abs();

    AbstentionFeatures {
        entity_overlap,
        max_score,
        speaker_coverage,
        evidence_density,
        negation_asymmetry,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        block::BlockKind,
        recall::{HitOrigin, index::FieldTag, query},
    };

    fn hit(excerpt: &str, score: f64, speaker: Option<&str>) -> Hit {
        Hit {
            block_id: "D-20260101-001".parse().unwrap(),
            kind: BlockKind::Decision,
            score,
            field: FieldTag::Statement,
            excerpt: excerpt.to_string(),
            speaker: speaker.map(str::to_string),
            source_file: PathBuf::from("decisions/DECISIONS.md"),
            line_range: (3, 6),
            origin: HitOrigin::Bm25,
        }
    }

    #[test]
    fn test_no_hits_abstains() {
        let analysis = query::analyze("did Alice not approve the migration?");
        let verdict = check(&analysis, &[], 0.20);
        assert!(verdict.abstain);
        assert!(verdict.confidence < 0.20);
        assert_eq!(verdict.features.max_score, 0.0);
    }

    #[test]
    fn test_negation_trap_without_evidence_abstains() {
        let analysis = query::analyze("did Alice not approve the migration?");
        // Weak, off-topic evidence with no mention of Alice and no
        // negation: asymmetry is maximal, overlap is zero.
        let hits = vec![hit("the warehouse exports run nightly", 0.1, None)];
        let verdict = check(&analysis, &hits, 0.20);
        assert!(verdict.abstain);
        assert!(verdict.features.negation_asymmetry > 0.9);
    }

    #[test]
    fn test_strong_evidence_passes() {
        let analysis = query::analyze("who approved the migration");
        let hits = vec![
            hit("Alice: approved the migration plan before the freeze", 1.0, Some("alice")),
            hit("migration approved and scheduled", 0.7, None),
        ];
        let verdict = check(&analysis, &hits, 0.20);
        assert!(!verdict.abstain);
        assert!(verdict.confidence > 0.5);
    }

    #[test]
    fn test_speaker_coverage_tracks_named_speakers() {
        let analysis = query::analyze("what did Alice say");
        let with_speaker = vec![hit("Alice: ship it", 0.9, Some("alice"))];
        let without = vec![hit("Alice was mentioned in passing", 0.9, None)];
        let covered = check(&analysis, &with_speaker, 0.20);
        let uncovered = check(&analysis, &without, 0.20);
        assert!(covered.features.speaker_coverage > uncovered.features.speaker_coverage);
    }
}
