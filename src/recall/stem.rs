//! Tokenization and stemming for the retrieval index.
//!
//! A simplified Porter stemmer (suffix rules only), an irregular verb table,
//! and month-name normalization. Both the indexer and the query expander go
//! through [`tokenize`] so index-side and query-side terms always agree.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Irregular verb lemmas the suffix rules cannot reach.
const IRREGULAR: &[(&str, &str)] = &[
    ("went", "go"),
    ("gone", "go"),
    ("said", "say"),
    ("made", "make"),
    ("did", "do"),
    ("done", "do"),
    ("took", "take"),
    ("taken", "take"),
    ("chose", "choose"),
    ("chosen", "choose"),
    ("wrote", "write"),
    ("written", "write"),
    ("ran", "run"),
    ("built", "build"),
    ("kept", "keep"),
    ("left", "leave"),
    ("found", "find"),
    ("brought", "bring"),
    ("thought", "think"),
    ("broke", "break"),
    ("broken", "break"),
    ("was", "be"),
    ("were", "be"),
    ("been", "be"),
    ("had", "have"),
    ("has", "have"),
];

/// Month names and abbreviations, normalized to their ordinal.
const MONTHS: &[(&str, &str)] = &[
    ("january", "1"),
    ("jan", "1"),
    ("february", "2"),
    ("feb", "2"),
    ("march", "3"),
    ("mar", "3"),
    ("april", "4"),
    ("apr", "4"),
    ("may", "5"),
    ("june", "6"),
    ("jun", "6"),
    ("july", "7"),
    ("jul", "7"),
    ("august", "8"),
    ("aug", "8"),
    ("september", "9"),
    ("sep", "9"),
    ("sept", "9"),
    ("october", "10"),
    ("oct", "10"),
    ("november", "11"),
    ("nov", "11"),
    ("december", "12"),
    ("dec", "12"),
];

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "if", "then", "else", "of", "to", "in", "on",
        "at", "by", "for", "with", "about", "into", "over", "after", "before", "is", "are",
        "be", "been", "being", "do", "does", "doing", "have", "had", "having", "it", "its",
        "this", "that", "these", "those", "i", "we", "you", "they", "he", "she", "them",
        "his", "her", "their", "our", "was", "were", "what", "which", "who", "whom", "not",
        "no", "so", "as", "from",
    ]
    .into_iter()
    .collect()
});

/// Whether a lowercase token is a stopword.
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

/// Normalize a month name to its ordinal, when the token is one.
pub fn normalize_month(token: &str) -> Option<&'static str> {
    MONTHS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, ordinal)| *ordinal)
}

/// Stem one lowercase token: irregular table, month normalization, then the
/// suffix rules.
pub fn stem(token: &str) -> String {
    if let Some((_, lemma)) = IRREGULAR.iter().find(|(form, _)| *form == token) {
        return (*lemma).to_string();
    }
    if let Some(ordinal) = normalize_month(token) {
        return ordinal.to_string();
    }
    suffix_strip(token)
}

/// Simplified Porter suffix rules, in three stages: inflection (`-s`,
/// `-ed`, `-ing`), derivation (`-ation`, `-ly`, `-ment`), and a final-`e`
/// strip so base and inflected forms meet at one stem (`approve` and
/// `approved` both become `approv`). Short tokens are left alone so `as`,
/// `is`, `us` and friends survive intact.
fn suffix_strip(token: &str) -> String {
    if token.len() <= 3 {
        return token.to_string();
    }

    // Stage 1: inflectional endings.
    let mut stemmed = if let Some(root) = token.strip_suffix("ies") {
        format!("{root}y")
    } else if let Some(root) = token.strip_suffix("sses") {
        format!("{root}ss")
    } else if let Some(root) = token
        .strip_suffix("ing")
        .filter(|root| root.len() >= 3 && root.chars().any(is_vowel))
    {
        undouble(root)
    } else if let Some(root) = token
        .strip_suffix("ed")
        .filter(|root| root.len() >= 3 && root.chars().any(is_vowel))
    {
        undouble(root)
    } else if let Some(root) = token.strip_suffix('s').filter(|root| {
        root.len() >= 3 && !root.ends_with('s') && !root.ends_with('u') && !root.ends_with('i')
    }) {
        root.to_string()
    } else {
        token.to_string()
    };

    // Stage 2: derivational endings (migration -> migrate, quickly ->
    // quick, deployment -> deploy).
    if let Some(root) = stemmed.strip_suffix("ation").filter(|root| root.len() >= 3) {
        stemmed = format!("{root}ate");
    } else if let Some(root) = stemmed.strip_suffix("ly").filter(|root| root.len() >= 3) {
        stemmed = root.to_string();
    } else if let Some(root) = stemmed.strip_suffix("ment").filter(|root| root.len() >= 4) {
        stemmed = root.to_string();
    }

    // Stage 3: final-e strip.
    if stemmed.len() > 4 && stemmed.ends_with('e') && !stemmed.ends_with("ee") {
        stemmed.pop();
    }
    stemmed
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

/// Collapse a doubled final consonant (running -> run, stopped -> stop).
fn undouble(root: &str) -> String {
    let bytes = root.as_bytes();
    if bytes.len() >= 2
        && bytes[bytes.len() - 1] == bytes[bytes.len() - 2]
        && !is_vowel(bytes[bytes.len() - 1] as char)
        && bytes[bytes.len() - 1] != b'l'
        && bytes[bytes.len() - 1] != b's'
    {
        root[..root.len() - 1].to_string()
    } else {
        root.to_string()
    }
}

/// Split text into lowercase alphanumeric tokens. No stemming.
pub fn raw_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Tokenize and stem, the form both the index and queries use.
pub fn tokenize(text: &str) -> Vec<String> {
    raw_tokens(text).iter().map(|token| stem(token)).collect()
}
