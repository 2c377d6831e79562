//! BM25 lexical scoring and sparse term vectors.
//!
//! `idf(t) = ln((N - df + 0.5) / (df + 0.5) + 1)`, except that a term present in
//! every document contributes nothing. Per-term score:
//!
//! ```text
//! BM25:  idf * tf * (k1 + 1) / (tf + k1 * (1 - b + b * dl / avgdl))
//! BM25+: idf * (tf * (k1 + 1) + delta) / (tf + k1 * (1 - b + b * dl / avgdl))
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::keywords::{STOPWORDS, tokenize_with};

/// Scoring variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bm25Variant {
    #[default]
    Okapi,
    /// Adds `delta` to the numerator to soften the penalty on long documents.
    Plus,
}

/// BM25 parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bm25Config {
    pub k1: f32,
    pub b: f32,
    pub variant: Bm25Variant,
    /// Only used by [`Bm25Variant::Plus`].
    pub delta: f32,
    /// Words ignored by the tokenizer; `None` uses [`STOPWORDS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopwords: Option<BTreeSet<String>>,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75, variant: Bm25Variant::Okapi, delta: 1.0, stopwords: None }
    }
}

impl Bm25Config {
    pub fn builder() -> Bm25ConfigBuilder {
        Bm25ConfigBuilder::default()
    }
}

/// Builder for a validated [`Bm25Config`].
#[derive(Debug, Clone, Default)]
pub struct Bm25ConfigBuilder {
    config: Bm25Config,
}

impl Bm25ConfigBuilder {
    pub fn k1(mut self, k1: f32) -> Self {
        self.config.k1 = k1;
        self
    }

    pub fn b(mut self, b: f32) -> Self {
        self.config.b = b;
        self
    }

    pub fn variant(mut self, variant: Bm25Variant) -> Self {
        self.config.variant = variant;
        self
    }

    pub fn delta(mut self, delta: f32) -> Self {
        self.config.delta = delta;
        self
    }

    pub fn stopwords<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.stopwords = Some(words.into_iter().map(Into::into).collect());
        self
    }

    /// # Errors
    ///
    /// Returns [`RagError::InvalidArgument`] if `k1 < 0`, `b` is outside `[0, 1]`,
    /// or `delta < 0`.
    pub fn build(self) -> Result<Bm25Config> {
        let c = &self.config;
        if c.k1.is_nan() || c.k1 < 0.0 {
            return Err(RagError::InvalidArgument(format!("k1 must be >= 0, got {}", c.k1)));
        }
        if !(0.0..=1.0).contains(&c.b) {
            return Err(RagError::InvalidArgument(format!("b must be in [0, 1], got {}", c.b)));
        }
        if c.delta.is_nan() || c.delta < 0.0 {
            return Err(RagError::InvalidArgument(format!("delta must be >= 0, got {}", c.delta)));
        }
        Ok(self.config)
    }
}

/// A sparse vector over the fitted vocabulary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SparseEmbedding {
    pub indices: Vec<usize>,
    pub values: Vec<f32>,
}

impl SparseEmbedding {
    /// Dot product; indices must be sorted ascending in both vectors.
    pub fn dot(&self, other: &SparseEmbedding) -> f32 {
        let (mut i, mut j, mut sum) = (0, 0, 0.0);
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }
}

/// A BM25 model fitted over a fixed corpus.
#[derive(Debug, Clone)]
pub struct Bm25 {
    config: Bm25Config,
    stopwords: BTreeSet<String>,
    vocab: BTreeMap<String, usize>,
    idf: Vec<f32>,
    doc_tf: Vec<BTreeMap<usize, usize>>,
    doc_len: Vec<usize>,
    avgdl: f32,
}

impl Bm25 {
    /// Fit document frequencies, IDF and lengths over `corpus`.
    ///
    /// A term found in every document has an IDF of 0 and adds nothing to any
    /// score. In a one-document corpus that holds for every term, so nothing
    /// scores above 0 and [`top_k`](Self::top_k) is empty.
    pub fn fit<S: AsRef<str>>(corpus: &[S], config: Bm25Config) -> Self {
        let stopwords: BTreeSet<String> = match &config.stopwords {
            Some(words) => words.iter().map(|w| w.to_lowercase()).collect(),
            None => STOPWORDS.iter().map(|w| (*w).to_string()).collect(),
        };
        let mut model = Self {
            config,
            stopwords,
            vocab: BTreeMap::new(),
            idf: Vec::new(),
            doc_tf: Vec::with_capacity(corpus.len()),
            doc_len: Vec::with_capacity(corpus.len()),
            avgdl: 1.0,
        };

        let mut df: Vec<usize> = Vec::new();
        for text in corpus {
            let tokens = model.tokenize(text.as_ref());
            let mut tf: BTreeMap<usize, usize> = BTreeMap::new();
            for token in &tokens {
                let next_id = model.vocab.len();
                let id = *model.vocab.entry(token.clone()).or_insert(next_id);
                if id == df.len() {
                    df.push(0);
                }
                *tf.entry(id).or_default() += 1;
            }
            for id in tf.keys() {
                df[*id] += 1;
            }
            model.doc_len.push(tokens.len());
            model.doc_tf.push(tf);
        }

        let n = corpus.len();
        let total: usize = model.doc_len.iter().sum();
        if n > 0 && total > 0 {
            model.avgdl = total as f32 / n as f32;
        }
        model.idf = df.iter().map(|&d| idf(n, d)).collect();
        model
    }

    /// Tokenize with this model's stopwords.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        tokenize_with(text, &self.stopwords)
    }

    pub fn config(&self) -> &Bm25Config {
        &self.config
    }

    pub fn num_docs(&self) -> usize {
        self.doc_len.len()
    }

    /// IDF of `term` (0 for unknown terms).
    pub fn idf(&self, term: &str) -> f32 {
        self.vocab.get(&term.to_lowercase()).map_or(0.0, |&id| self.idf[id])
    }

    fn term_weight(&self, term_id: usize, doc: usize) -> f32 {
        let Some(&tf) = self.doc_tf[doc].get(&term_id) else {
            return 0.0;
        };
        let tf = tf as f32;
        let (k1, b) = (self.config.k1, self.config.b);
        let length_norm = 1.0 - b + b * self.doc_len[doc] as f32 / self.avgdl;
        let numerator = match self.config.variant {
            Bm25Variant::Okapi => tf * (k1 + 1.0),
            Bm25Variant::Plus => tf * (k1 + 1.0) + self.config.delta,
        };
        self.idf[term_id] * numerator / (tf + k1 * length_norm)
    }

    fn query_term_ids(&self, query: &str) -> Vec<usize> {
        let ids: BTreeSet<usize> =
            self.tokenize(query).iter().filter_map(|t| self.vocab.get(t).copied()).collect();
        ids.into_iter().collect()
    }

    /// BM25 score of document `doc` for `query`. Repeated query terms count once.
    pub fn score(&self, query: &str, doc: usize) -> f32 {
        if doc >= self.num_docs() {
            return 0.0;
        }
        self.query_term_ids(query).into_iter().map(|t| self.term_weight(t, doc)).sum()
    }

    /// Scores of every document, in corpus order.
    pub fn scores(&self, query: &str) -> Vec<f32> {
        let terms = self.query_term_ids(query);
        (0..self.num_docs())
            .map(|doc| terms.iter().map(|&t| self.term_weight(t, doc)).sum())
            .collect()
    }

    /// The `k` best documents with a positive score, best first, ties by position.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(usize, f32)> {
        let mut ranked: Vec<(usize, f32)> =
            self.scores(query).into_iter().enumerate().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked
    }

    /// Indicator vector of the query's known terms.
    pub fn sparse_embedding_for_query(&self, query: &str) -> SparseEmbedding {
        let indices = self.query_term_ids(query);
        let values = vec![1.0; indices.len()];
        SparseEmbedding { indices, values }
    }

    /// Per-term BM25 weights of document `doc`; its dot product with
    /// [`sparse_embedding_for_query`](Self::sparse_embedding_for_query) is the score.
    pub fn sparse_embedding_for_doc(&self, doc: usize) -> SparseEmbedding {
        let mut out = SparseEmbedding::default();
        if let Some(tf) = self.doc_tf.get(doc) {
            for &term in tf.keys() {
                out.indices.push(term);
                out.values.push(self.term_weight(term, doc));
            }
        }
        out
    }
}

fn idf(n: usize, df: usize) -> f32 {
    if df == 0 || df >= n {
        return 0.0;
    }
    let (n, df) = (n as f32, df as f32);
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: [&str; 4] = [
        "machine learning models learn from data",
        "deep learning is a branch of machine learning",
        "the weather today is sunny",
        "cooking pasta requires boiling water",
    ];

    #[test]
    fn both_terms_rank_first() {
        let bm25 = Bm25::fit(&CORPUS, Bm25Config::default());
        let top = bm25.top_k("machine learning", 4);
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|(doc, _)| *doc < 2));
    }

    #[test]
    fn ubiquitous_term_contributes_nothing() {
        let corpus = ["apple pie", "apple tart", "apple juice"];
        let bm25 = Bm25::fit(&corpus, Bm25Config::default());
        assert_eq!(bm25.idf("apple"), 0.0);
        assert!(bm25.scores("apple").iter().all(|s| *s == 0.0));
        assert!(bm25.score("pie", 0) > 0.0);
    }

    #[test]
    fn single_document_corpus_scores_nothing() {
        let bm25 = Bm25::fit(&["machine learning notes"], Bm25Config::default());
        assert_eq!(bm25.idf("machine"), 0.0);
        assert_eq!(bm25.score("machine learning", 0), 0.0);
        assert!(bm25.top_k("machine learning", 5).is_empty());
    }

    #[test]
    fn tokenizer_matches_keyword_tokenizer() {
        let bm25 = Bm25::fit(&["x"], Bm25Config::default());
        let text = "The Cats, and 3 dogs; chased-the mice!";
        assert_eq!(bm25.tokenize(text), crate::keywords::tokenize(text));
    }

    #[test]
    fn sparse_dot_equals_score() {
        let bm25 = Bm25::fit(&CORPUS, Bm25Config::default());
        let q = bm25.sparse_embedding_for_query("machine learning data");
        for doc in 0..CORPUS.len() {
            let dot = q.dot(&bm25.sparse_embedding_for_doc(doc));
            assert!((dot - bm25.score("machine learning data", doc)).abs() < 1e-6);
        }
    }

    #[test]
    fn plus_variant_scores_at_least_okapi() {
        let okapi = Bm25::fit(&CORPUS, Bm25Config::default());
        let plus = Bm25::fit(
            &CORPUS,
            Bm25Config::builder().variant(Bm25Variant::Plus).delta(1.0).build().unwrap(),
        );
        for doc in 0..CORPUS.len() {
            assert!(plus.score("learning", doc) >= okapi.score("learning", doc));
        }
    }

    #[test]
    fn builder_validates() {
        assert!(Bm25Config::builder().b(1.5).build().is_err());
        assert!(Bm25Config::builder().k1(-1.0).build().is_err());
        assert!(Bm25Config::builder().delta(f32::NAN).build().is_err());
    }

    #[test]
    fn custom_stopwords() {
        let config = Bm25Config::builder().stopwords(["beta"]).build().unwrap();
        let bm25 = Bm25::fit(&["alpha beta", "gamma"], config);
        assert_eq!(bm25.tokenize("Alpha BETA"), vec!["alpha"]);
    }
}
