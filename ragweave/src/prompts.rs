//! Prompt templates used by indexes, retrievers, selectors and synthesis.
//!
//! Templates use `{name}` placeholders filled by [`PromptTemplate::format`].

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A text template with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Substitute every `{key}`. Unknown placeholders are left in place.
    pub fn format(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.template.clone(), |text, (key, value)| {
            text.replace(&format!("{{{key}}}"), value)
        })
    }
}

impl From<&str> for PromptTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

pub const SUMMARY_PROMPT: &str = "Summarize the passages below using only the information they \
contain and keeping as many key details as possible.\n\n{context_str}\n\nSUMMARY:\n";

pub const TREE_INSERT_PROMPT: &str = "Below is a numbered list (1 to {num_chunks}) of summaries.\n\
---------------------\n{context_list}\n---------------------\n\
A new piece of information arrived: {new_chunk_text}\n\
Answer with the number of the summary this information belongs to, in the format 'ANSWER: <number>'.\n";

pub const TREE_SELECT_PROMPT: &str = "Below is a numbered list (1 to {num_chunks}) of choices, each \
a summary of further content.\n---------------------\n{context_list}\n---------------------\n\
Using only the choices above, return the one most relevant to the question: '{query_str}'\n\
Answer in the format 'ANSWER: <number>' and briefly explain the choice.\n";

pub const TREE_SELECT_MULTIPLE_PROMPT: &str = "Below is a numbered list (1 to {num_chunks}) of \
choices, each a summary of further content.\n---------------------\n{context_list}\n\
---------------------\nUsing only the choices above, return the top {branching_factor} choices \
(no more than {num_chunks}, ranked by relevance) for the question: '{query_str}'\n\
Answer in the format 'ANSWER: <numbers>' and briefly explain the choices.\n";

pub const KEYWORD_EXTRACT_PROMPT: &str = "Extract up to {max_keywords} keywords from the text \
below. Avoid stopwords.\n---------------------\n{text}\n---------------------\n\
Answer in the comma-separated format 'KEYWORDS: <keywords>'\n";

pub const QUERY_KEYWORD_EXTRACT_PROMPT: &str = "A question is provided below. Extract up to \
{max_keywords} keywords from it that are best suited to look up answers. Avoid stopwords.\n\
---------------------\n{question}\n---------------------\n\
Answer in the comma-separated format 'KEYWORDS: <keywords>'\n";

pub const KG_TRIPLET_EXTRACT_PROMPT: &str = "Extract up to {max_knowledge_triplets} knowledge \
triplets from the text below, in the form (subject, predicate, object). Avoid stopwords.\n\
---------------------\nExample:\nText: Alice is Bob's mother.\nTriplets:\n(Alice, is mother of, Bob)\n\
Text: Philz is a coffee shop founded in Berkeley in 1982.\nTriplets:\n\
(Philz, is, coffee shop)\n(Philz, founded in, Berkeley)\n(Philz, founded in, 1982)\n\
---------------------\nText: {text}\nTriplets:\n";

pub const CHOICE_SELECT_PROMPT: &str = "Below is a list of documents, each with a number. A \
question follows. Respond with the numbers of the documents to consult, most relevant first, each \
with a relevance score from 1 to 10. Leave out irrelevant documents.\n\
Answer with one line per document in the format 'Doc: <number>, Relevance: <score>'.\n\n\
{context_str}\nQuestion: {query_str}\nAnswer:\n";

pub const SINGLE_SELECT_PROMPT: &str = "Below are {num_choices} numbered choices.\n\
---------------------\n{context_list}\n---------------------\n\
Using only the choices above, pick the one most relevant to the question: '{query_str}'\n\
Answer with JSON only, in the format [{\"choice\": <number>, \"reason\": \"<why>\"}]\n";

pub const MULTI_SELECT_PROMPT: &str = "Below are {num_choices} numbered choices.\n\
---------------------\n{context_list}\n---------------------\n\
Using only the choices above, pick at most {max_outputs} choices (not necessarily in order) most \
relevant to the question: '{query_str}'\n\
Answer with JSON only, in the format [{\"choice\": <number>, \"reason\": \"<why>\"}, ...]\n";

pub const TEXT_QA_PROMPT: &str = "Context information is below.\n---------------------\n\
{context_str}\n---------------------\nGiven the context information and not prior knowledge, \
answer the query.\nQuery: {query_str}\nAnswer: ";

pub const REFINE_PROMPT: &str = "The original query is: {query_str}\n\
An existing answer is: {existing_answer}\n\
Refine the existing answer (only if needed) with the additional context below.\n\
------------\n{context_msg}\n------------\n\
If the context is not useful, return the existing answer unchanged.\nRefined Answer: ";

pub const QUERY_GEN_PROMPT: &str = "Generate {num_queries} search queries, one per line, related \
to the following input query:\nQuery: {query}\nQueries:\n";

/// Render items as `(1) first\n\n(2) second...`.
pub fn numbered_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("({}) {}", i + 1, item.as_ref()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

static ANSWER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ANSWER:\s*([0-9][0-9,\s]*)").expect("static regex")
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static regex"));

/// Numbers picked in an LLM answer, in order, at most `n`.
///
/// Looks after an `ANSWER:` marker first and falls back to every number in the text.
pub fn extract_numbers(response: &str, n: usize) -> Vec<usize> {
    let scope = ANSWER_RE
        .captures(response)
        .and_then(|c| c.get(1))
        .map_or(response, |m| m.as_str());
    NUMBER_RE
        .find_iter(scope)
        .filter_map(|m| m.as_str().parse().ok())
        .take(n)
        .collect()
}

/// Keywords from a `KEYWORDS: a, b, c` answer, lowercased.
pub fn extract_keywords_given_response(response: &str, prefix: &str) -> Vec<String> {
    let body = response
        .find(prefix)
        .map_or(response, |at| &response[at + prefix.len()..])
        .lines()
        .next()
        .unwrap_or_default();
    let mut out: Vec<String> = Vec::new();
    for keyword in body.split(',').map(|k| k.trim().to_lowercase()).filter(|k| !k.is_empty()) {
        if !out.contains(&keyword) {
            out.push(keyword);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_substitutes_placeholders() {
        let p = PromptTemplate::new("Q: {query_str} ({n}) {missing}");
        assert_eq!(p.format(&[("query_str", "why"), ("n", "2")]), "Q: why (2) {missing}");
    }

    #[test]
    fn numbers_prefer_answer_marker() {
        assert_eq!(extract_numbers("I considered 3 options. ANSWER: 2", 1), vec![2]);
        assert_eq!(extract_numbers("ANSWER: 1, 3 because", 2), vec![1, 3]);
        assert_eq!(extract_numbers("pick 4", 1), vec![4]);
        assert!(extract_numbers("none", 1).is_empty());
    }

    #[test]
    fn keywords_after_prefix() {
        let kws =
            extract_keywords_given_response("KEYWORDS: Cats, dogs , cats\nextra", "KEYWORDS:");
        assert_eq!(kws, vec!["cats", "dogs"]);
    }

    #[test]
    fn numbered() {
        assert_eq!(numbered_list(&["a", "b"]), "(1) a\n\n(2) b");
    }
}
