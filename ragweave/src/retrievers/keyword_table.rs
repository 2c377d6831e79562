use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::data_structs::KeywordTable;
use crate::error::Result;
use crate::indices::KeywordExtractor;
use crate::models::Llm;
use crate::schema::{NodeWithScore, QueryBundle};
use crate::storage::DocStore;

use super::Retriever;

/// Looks query keywords up in a keyword table.
///
/// A node's score is the share of query keywords it matched. Ties are broken by
/// node id.
pub struct KeywordTableRetriever {
    index_struct: Arc<RwLock<KeywordTable>>,
    docstore: Arc<DocStore>,
    llm: Arc<dyn Llm>,
    extractor: KeywordExtractor,
    max_keywords_per_query: usize,
    num_chunks_per_query: usize,
}

impl KeywordTableRetriever {
    pub fn new(
        index_struct: Arc<RwLock<KeywordTable>>,
        docstore: Arc<DocStore>,
        llm: Arc<dyn Llm>,
        extractor: KeywordExtractor,
        max_keywords_per_query: usize,
        num_chunks_per_query: usize,
    ) -> Self {
        Self {
            index_struct,
            docstore,
            llm,
            extractor,
            max_keywords_per_query,
            num_chunks_per_query,
        }
    }
}

#[async_trait]
impl Retriever for KeywordTableRetriever {
    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        let keywords = self
            .extractor
            .query_keywords(self.llm.as_ref(), &query.query_str, self.max_keywords_per_query)
            .await?;
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        {
            let table = self.index_struct.read();
            for keyword in &keywords {
                for id in table.table.get(keyword).into_iter().flatten() {
                    *counts.entry(id.clone()).or_default() += 1;
                }
            }
        }
        // BTreeMap iteration is id-ordered, the stable sort keeps that for ties
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(self.num_chunks_per_query);
        debug!(?keywords, candidates = ranked.len(), "keyword table lookup");

        let total = keywords.len() as f32;
        ranked
            .into_iter()
            .map(|(id, count)| {
                let node = self.docstore.get_node(&id)?;
                Ok(NodeWithScore::new(node, count as f32 / total))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockLlm;
    use crate::schema::Node;

    fn retriever(limit: usize) -> KeywordTableRetriever {
        let docstore = Arc::new(DocStore::in_memory());
        docstore
            .add_documents(
                &[Node::with_id("n1", "red apples"), Node::with_id("n2", "red fire trucks")],
                true,
            )
            .unwrap();
        let mut table = KeywordTable::new("k");
        table.add_node(["red", "apples"], "n1");
        table.add_node(["red", "fire", "trucks"], "n2");
        KeywordTableRetriever::new(
            Arc::new(RwLock::new(table)),
            docstore,
            Arc::new(MockLlm::default()),
            KeywordExtractor::Simple,
            10,
            limit,
        )
    }

    #[tokio::test]
    async fn ranks_by_matched_keyword_share() {
        let hits = retriever(10).retrieve_str("red fire").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id(), "n2");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
    }

    #[tokio::test]
    async fn ties_break_by_id_and_limit_applies() {
        let hits = retriever(1).retrieve_str("red").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), "n1");
    }

    #[tokio::test]
    async fn no_keywords_no_hits() {
        assert!(retriever(10).retrieve_str("the of").await.unwrap().is_empty());
    }
}
