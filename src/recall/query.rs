//! Query analysis: rule-based classification and gated expansion.
//!
//! Classes are mutually non-exclusive flags. `adversarial` queries expand in
//! morph-only mode (lemma and month normalization, no synonyms) so the
//! expansion cannot drift the search toward the topic a negation trap names.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use super::stem::{self, normalize_month, raw_tokens};

static DATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2}|\d{4})\b").expect("date token"));

static ORDINAL_WEEK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(first|second|third|fourth|last|\d+(st|nd|rd|th))\s+week\b")
        .expect("ordinal week")
});

static TEMPORAL_CUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(before|after|when|during)\b").expect("temporal cue"));

static MULTI_HOP_CUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(and|then|both)\b").expect("multi-hop cue"));

static ADVERSARIAL_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\b(did|does|do|was|were|is|are|has|have)\s+\w+\s+(really|actually|not)\b|\bis it true\b|\bdidn'?t\b|\bnever\b|\bwasn'?t\b)",
    )
    .expect("adversarial cue")
});

/// Domain synonym map. Keys and values are matched post-stemming.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("auth", &["authentication", "login", "oauth", "oauth2", "jwt", "session"]),
    ("db", &["database", "postgresql", "mysql", "sql", "schema", "migration"]),
    ("database", &["db", "postgresql", "mysql", "sql", "schema", "migration"]),
    ("api", &["endpoint", "rest", "graphql", "route", "contract"]),
    ("deployment", &["deploy", "release", "rollout", "pipeline", "ci"]),
    ("deploy", &["deployment", "release", "rollout", "pipeline", "ci"]),
    ("testing", &["test", "unit", "integration", "coverage", "regression"]),
    ("test", &["testing", "unit", "integration", "coverage", "regression"]),
    ("security", &["vulnerability", "cve", "encryption", "tls", "secret"]),
    ("performance", &["latency", "throughput", "benchmark", "optimization", "cache"]),
];

/// Mutually non-exclusive query classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryClass {
    pub temporal: bool,
    pub multi_hop: bool,
    pub adversarial: bool,
}

impl QueryClass {
    /// No other class fired.
    pub fn is_single_hop(&self) -> bool {
        !self.temporal && !self.multi_hop && !self.adversarial
    }
}

/// The analyzed form of one query: classes, expansion terms, and the
/// features downstream stages key off.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub class: QueryClass,
    /// Stemmed query tokens in order, stopwords included (bigrams need
    /// the original adjacency).
    pub tokens: Vec<String>,
    /// The expansion set `E(q)`: stemmed, deduplicated, stopwords dropped.
    pub expanded: Vec<String>,
    /// Adjacent token pairs from the original query.
    pub bigrams: Vec<(String, String)>,
    /// Capitalized names as they appeared (lowercased).
    pub names: Vec<String>,
    /// A concrete date the query pinned down, when one is present.
    pub date: Option<NaiveDate>,
    /// Whether the query contains an explicit negation.
    pub negated: bool,
}

/// Classify and expand a natural-language query.
pub fn analyze(query: &str) -> QueryAnalysis {
    let raw = raw_tokens(query);
    let names = capitalized_names(query);

    let class = QueryClass {
        temporal: DATE_TOKEN.is_match(query)
            || ORDINAL_WEEK.is_match(query)
            || TEMPORAL_CUE.is_match(query)
            || raw.iter().any(|token| normalize_month(token).is_some()),
        multi_hop: names.len() >= 2 || MULTI_HOP_CUE.is_match(query),
        adversarial: ADVERSARIAL_CUE.is_match(query),
    };

    let tokens: Vec<String> = raw.iter().map(|token| stem::stem(token)).collect();
    let bigrams = tokens
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    // Morph-only for adversarial queries: lemma + month normalization, no
    // synonym drift.
    let mut expanded: Vec<String> = tokens
        .iter()
        .filter(|token| !stem::is_stopword(token))
        .cloned()
        .collect();
    if !class.adversarial {
        for token in &tokens {
            if let Some((_, synonyms)) = SYNONYMS.iter().find(|(key, _)| key == token) {
                for synonym in *synonyms {
                    expanded.push(stem::stem(synonym));
                }
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    expanded.retain(|term| seen.insert(term.clone()));

    let date = DATE_TOKEN
        .find_iter(query)
        .find_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok());

    let negated = raw.iter().any(|token| {
        matches!(token.as_str(), "not" | "never" | "didn" | "wasn" | "don" | "doesn")
    });

    QueryAnalysis {
        class,
        tokens,
        expanded,
        bigrams,
        names,
        date,
        negated,
    }
}

/// Words written capitalized mid-query; a cheap named-entity cue.
fn capitalized_names(query: &str) -> Vec<String> {
    let mut names = Vec::new();
    for (index, word) in query.split_whitespace().enumerate() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        let mut chars = cleaned.chars();
        let capitalized = chars
            .next()
            .map(|first| first.is_uppercase() && chars.all(|c| !c.is_uppercase()))
            .unwrap_or(false);
        // Skip the sentence-initial word: capitalization there is not a cue.
        if index > 0 && capitalized && cleaned.len() > 1 {
            let lowered = cleaned.to_lowercase();
            if !stem::is_stopword(&lowered) && !names.contains(&lowered) {
                names.push(lowered);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_classification() {
        assert!(analyze("what changed before 2026-01-15").class.temporal);
        assert!(analyze("decisions from January").class.temporal);
        assert!(analyze("the first week of the migration").class.temporal);
        assert!(!analyze("why postgres").class.temporal);
    }

    #[test]
    fn test_multi_hop_classification() {
        assert!(analyze("how do Alice and Bob split the work").class.multi_hop);
        assert!(analyze("what did Alice tell Bob").class.multi_hop);
        assert!(!analyze("what is the database engine").class.multi_hop);
    }

    #[test]
    fn test_adversarial_classification() {
        let analysis = analyze("did Alice not approve the migration?");
        assert!(analysis.class.adversarial);
        assert!(analysis.negated);

        assert!(analyze("is it true that we use mysql").class.adversarial);
        assert!(analyze("we never enabled tls, right").class.adversarial);
        assert!(!analyze("who approved the migration").class.adversarial);
    }

    #[test]
    fn test_single_hop_default() {
        let analysis = analyze("database engine choice");
        assert!(analysis.class.is_single_hop());
    }

    #[test]
    fn test_auth_expansion() {
        let analysis = analyze("auth");
        for expected in ["authentication", "login", "oauth", "jwt", "session"] {
            let stemmed = stem::stem(expected);
            assert!(
                analysis.expanded.contains(&stemmed),
                "expansion missing {expected} ({stemmed})"
            );
        }
    }

    #[test]
    fn test_adversarial_expansion_is_morph_only() {
        let analysis = analyze("did Alice not approve the auth migration?");
        assert!(analysis.class.adversarial);
        // Lemmas survive, synonyms do not.
        assert!(analysis.expanded.contains(&stem::stem("approve")));
        assert!(!analysis.expanded.contains(&stem::stem("oauth")));
        assert!(!analysis.expanded.contains(&stem::stem("login")));
    }

    #[test]
    fn test_bigrams_and_date() {
        let analysis = analyze("migration approved on 2026-01-15");
        assert!(analysis.bigrams.contains(&(
            stem::stem("migration"),
            stem::stem("approved")
        )));
        assert_eq!(analysis.date, NaiveDate::from_ymd_opt(2026, 1, 15));
    }
}
