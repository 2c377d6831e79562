//! Embedding model trait and vector similarity helpers.

use std::cmp::Ordering;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::schema::{MetadataMode, Node};

/// A model that turns text into dense vectors.
///
/// The default [`text_embeddings`](EmbeddingModel::text_embeddings) implementation
/// calls [`text_embedding`](EmbeddingModel::text_embedding) sequentially; backends
/// that support native batching should override it.
///
/// # Example
///
/// ```rust,ignore
/// use ragweave::models::{EmbeddingModel, MockEmbedding};
///
/// let model = MockEmbedding::new(64);
/// let embedding = model.text_embedding("hello world").await?;
/// assert_eq!(embedding.len(), model.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a passage of text.
    async fn text_embedding(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a query. Defaults to [`text_embedding`](EmbeddingModel::text_embedding).
    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        self.text_embedding(query).await
    }

    /// Embed a batch of passages.
    async fn text_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.text_embedding(text).await?);
        }
        Ok(results)
    }

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;
}

/// Fill in missing embeddings on `nodes`, `batch_size` texts per model call.
pub async fn embed_nodes(
    model: &dyn EmbeddingModel,
    nodes: &mut [Node],
    batch_size: usize,
) -> Result<()> {
    let missing: Vec<usize> =
        nodes.iter().enumerate().filter(|(_, n)| n.embedding.is_none()).map(|(i, _)| i).collect();
    if missing.is_empty() {
        return Ok(());
    }
    for batch in missing.chunks(batch_size.max(1)) {
        let texts: Vec<String> =
            batch.iter().map(|&i| nodes[i].content(MetadataMode::Embed)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let embeddings = model.text_embeddings(&refs).await?;
        if embeddings.len() != batch.len() {
            return Err(RagError::InvalidArgument(format!(
                "embedding model returned {} vectors for {} inputs",
                embeddings.len(),
                batch.len()
            )));
        }
        for (&i, embedding) in batch.iter().zip(embeddings) {
            nodes[i].embedding = Some(embedding);
        }
        debug!(batch = batch.len(), "embedded node batch");
    }
    Ok(())
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine similarity that rejects mismatched dimensions.
pub fn checked_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(RagError::InvalidArgument(format!(
            "vector dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(cosine_similarity(a, b))
}

/// Rank `candidates` by similarity to `query`, returning `(position, score)` pairs, best first.
pub fn top_k_by_similarity<'a, I>(
    query: &[f32],
    candidates: I,
    top_k: usize,
) -> Result<Vec<(usize, f32)>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut scored = candidates
        .into_iter()
        .enumerate()
        .map(|(i, emb)| checked_similarity(query, emb).map(|s| (i, s)))
        .collect::<Result<Vec<_>>>()?;
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    scored.truncate(top_k);
    Ok(scored)
}

/// Maximal marginal relevance selection.
///
/// `threshold` trades relevance (1.0) against diversity (0.0). Returned scores are
/// the plain query similarities of the selected candidates.
pub fn mmr_by_similarity(
    query: &[f32],
    candidates: &[&[f32]],
    top_k: usize,
    threshold: f32,
) -> Result<Vec<(usize, f32)>> {
    let relevance = candidates
        .iter()
        .map(|emb| checked_similarity(query, emb))
        .collect::<Result<Vec<_>>>()?;
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<(usize, f32)> = Vec::new();

    while selected.len() < top_k && !remaining.is_empty() {
        let mut best: Option<(usize, f32)> = None;
        for (slot, &i) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&(j, _)| cosine_similarity(candidates[i], candidates[j]))
                .fold(0.0f32, f32::max);
            let score = threshold * relevance[i] - (1.0 - threshold) * redundancy;
            if best.is_none_or(|(_, b)| score > b) {
                best = Some((slot, score));
            }
        }
        let Some((slot, _)) = best else { break };
        let i = remaining.remove(slot);
        selected.push((i, relevance[i]));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_orthogonal_and_parallel() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn dimension_mismatch_is_invalid_argument() {
        let err = checked_similarity(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
    }

    #[test]
    fn mmr_prefers_diverse_second_pick() {
        let a: &[f32] = &[1.0, 0.0, 0.0];
        let a_dup: &[f32] = &[1.0, 0.05, 0.0];
        let b: &[f32] = &[0.0, 0.0, 1.0];
        let picks = mmr_by_similarity(&[1.0, 0.0, 0.5], &[a, a_dup, b], 2, 0.5).unwrap();
        assert_eq!(picks[0].0, 0);
        assert_eq!(picks[1].0, 2);
    }
}
