//! Tokenization, stopwords and frequency-based keyword extraction.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

/// English stopwords dropped by the default tokenizers.
pub static STOPWORDS: LazyLock<BTreeSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
        "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
        "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
        "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
        "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself",
        "just", "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on",
        "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same",
        "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
        "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
        "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
        "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
        "yourself", "yourselves",
    ]
    .into_iter()
    .collect()
});

/// Lowercase alphanumeric words, in order, stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_with(text, &*STOPWORDS)
}

/// Lowercase alphanumeric words, in order, dropping anything in `stopwords`.
pub fn tokenize_with<S>(text: &str, stopwords: &BTreeSet<S>) -> Vec<String>
where
    S: Borrow<str> + Ord,
{
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !stopwords.contains(w.as_str()))
        .collect()
}

/// The `max_keywords` most frequent tokens of at least three characters.
///
/// Ties keep first-occurrence order, so the result is deterministic.
pub fn simple_extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, token) in tokenize(text).into_iter().enumerate() {
        if token.chars().count() < 3 {
            continue;
        }
        counts.entry(token).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|(_, (ca, pa)), (_, (cb, pb))| cb.cmp(ca).then(pa.cmp(pb)));
    ranked.into_iter().take(max_keywords).map(|(token, _)| token).collect()
}

/// Expand keywords with their individual words, so `"new york"` also matches `"york"`.
pub fn expand_with_subtokens(keywords: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in keywords {
        if !out.contains(keyword) {
            out.push(keyword.clone());
        }
        for sub in tokenize(keyword) {
            if !out.contains(&sub) {
                out.push(sub);
            }
        }
    }
    out
}
