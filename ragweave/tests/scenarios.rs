//! End-to-end retrieval scenarios over the public API.

use std::sync::Arc;

use async_trait::async_trait;
use ragweave::bm25::Bm25Config;
use ragweave::data_structs::{IndexDict, IndexStruct};
use ragweave::indices::{IndexConfigs, KeywordTableConfig, TreeIndexConfig, VectorIndexConfig};
use ragweave::models::MockLlm;
use ragweave::node_parser::{HierarchicalNodeParser, NodeParser, get_leaf_nodes, get_root_nodes};
use ragweave::retrievers::{
    AutoMergingConfig, AutoMergingRetriever, Bm25Retriever, FusionConfig, FusionMode,
    QueryFusionRetriever, RetrieverOptions,
};
use ragweave::{
    Document, Index, KeywordTableIndex, Node, NodeWithScore, QueryBundle, Result, Retriever,
    Settings, StorageContext, TreeIndex, VectorStoreIndex, load_index_from_storage,
    load_index_from_storage_with,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Fixed(Vec<(&'static str, f32)>);

#[async_trait]
impl Retriever for Fixed {
    async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        Ok(self.0.iter().map(|(id, s)| NodeWithScore::new(Node::with_id(*id, *id), *s)).collect())
    }
}

#[tokio::test]
async fn keyword_table_finds_exact_token() {
    init_tracing();
    let documents = vec![
        Document::new("D1", "The cat sat on the mat"),
        Document::new("D2", "Dogs chase cats"),
        Document::new("D3", "The sun is bright"),
    ];
    let config = KeywordTableConfig { max_keywords_per_query: 5, ..Default::default() };
    let index = KeywordTableIndex::from_documents(
        &documents,
        StorageContext::from_defaults(),
        Settings::default(),
        config,
    )
    .await
    .unwrap();

    let retriever = index.as_retriever(&RetrieverOptions::new()).unwrap();
    let hits = retriever.retrieve_str("cats").await.unwrap();
    let d2 = hits.iter().find(|h| h.node.ref_doc_id() == Some("D2")).expect("D2 retrieved");
    assert!(d2.score >= 0.5);
    assert!(hits.iter().all(|h| h.node.ref_doc_id() != Some("D3")));
}

#[tokio::test]
async fn reciprocal_rank_fusion_orders_by_summed_ranks() {
    let a: Arc<dyn Retriever> = Arc::new(Fixed(vec![("n1", 0.9), ("n2", 0.8), ("n3", 0.7)]));
    let b: Arc<dyn Retriever> = Arc::new(Fixed(vec![("n3", 0.95), ("n1", 0.5)]));
    let config = FusionConfig {
        mode: FusionMode::ReciprocalRank,
        similarity_top_k: 3,
        ..FusionConfig::default()
    };
    let fusion = QueryFusionRetriever::new(vec![a, b], config).unwrap();
    let hits = fusion.retrieve_str("q").await.unwrap();

    let ids: Vec<&str> = hits.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec!["n1", "n3", "n2"]);
    assert!((hits[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-5);
    assert!((hits[1].score - (1.0 / 63.0 + 1.0 / 61.0)).abs() < 1e-5);
    assert!((hits[2].score - 1.0 / 62.0).abs() < 1e-5);
}

#[tokio::test]
async fn auto_merging_climbs_hierarchy() {
    init_tracing();
    let document = Document::new(
        "animals",
        "Cats purr softly. Dogs bark loudly. Birds sing early. Fish swim deep.",
    );
    let parser = HierarchicalNodeParser::new(vec![200, 30], 0).unwrap();
    let nodes = parser.get_nodes_from_documents(&[document]);
    let leaves = get_leaf_nodes(&nodes);
    let roots = get_root_nodes(&nodes);
    assert_eq!(roots.len(), 1);

    let storage = StorageContext::from_defaults();
    storage.docstore().add_documents(&nodes, true).unwrap();
    let config = VectorIndexConfig { similarity_top_k: leaves.len(), ..Default::default() };
    let index =
        VectorStoreIndex::from_nodes(leaves, storage.clone(), Settings::default(), config)
            .await
            .unwrap();

    let retriever = AutoMergingRetriever::new(
        index.as_retriever(&RetrieverOptions::new()).unwrap(),
        storage.docstore().clone(),
        AutoMergingConfig::default(),
    )
    .unwrap();
    let hits = retriever.retrieve_str("cats purr").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id(), roots[0].id);
}

struct Hits(Vec<NodeWithScore>);

#[async_trait]
impl Retriever for Hits {
    async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn auto_merging_handles_sibling_chains_across_parents() {
    init_tracing();
    let document = Document::new(
        "report",
        "Alpha one here. Alpha two here.\n\nBravo solo.\n\nCharlie one now. Charlie two now.",
    );
    let parser = HierarchicalNodeParser::new(vec![40, 25], 0).unwrap();
    let nodes = parser.get_nodes_from_documents(&[document]);
    assert_eq!(get_root_nodes(&nodes).len(), 3);
    let leaves = get_leaf_nodes(&nodes);
    assert_eq!(leaves.len(), 5);

    let leaf = |text: &str| leaves.iter().find(|n| n.text == text).cloned().expect("leaf");
    let alpha_two = leaf("Alpha two here.");
    let bravo = leaf("Bravo solo.");
    let charlie_one = leaf("Charlie one now.");
    // the leaf chain runs through the single-child middle parent
    assert_eq!(alpha_two.next().map(|r| r.node_id.as_str()), Some(bravo.id.as_str()));
    assert_eq!(charlie_one.prev().map(|r| r.node_id.as_str()), Some(bravo.id.as_str()));
    let bravo_parent = bravo.parent().map(|r| r.node_id.clone()).expect("parent");

    let storage = StorageContext::from_defaults();
    storage.docstore().add_documents(&nodes, true).unwrap();
    let hits = Hits(vec![
        NodeWithScore::new(alpha_two.clone(), 0.9),
        NodeWithScore::new(charlie_one.clone(), 0.7),
    ]);
    let retriever = AutoMergingRetriever::new(
        Arc::new(hits),
        storage.docstore().clone(),
        AutoMergingConfig::default(),
    )
    .unwrap();
    let hits = retriever.retrieve_str("alpha charlie").await.unwrap();

    let ids: Vec<&str> = hits.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![alpha_two.id.as_str(), bravo_parent.as_str(), charlie_one.id.as_str()]);
    assert!((hits[1].score - 0.8).abs() < 1e-6);
    assert!(hits.iter().all(|h| nodes.iter().any(|n| n.id == h.id())));
}

#[tokio::test]
async fn storage_context_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageContext::from_defaults();
    let node = Node::with_id("x", "hello");
    storage.docstore().add_documents(std::slice::from_ref(&node), true).unwrap();
    let mut dict = IndexDict::new("vector-index");
    dict.add_node("x", "x");
    let index_struct = IndexStruct::Vector(dict);
    storage.index_store().add_index_struct(&index_struct).unwrap();
    storage.persist(dir.path()).await.unwrap();

    let loaded = StorageContext::from_persist_dir(dir.path()).unwrap();
    assert_eq!(loaded.docstore().get_node("x").unwrap().hash, node.hash);
    assert_eq!(loaded.index_store().get_index_struct("").unwrap(), Some(index_struct));
    assert!(dir.path().join("graph_store.json").exists());
}

#[tokio::test]
async fn reloaded_tree_keeps_build_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_llm(Arc::new(MockLlm::fixed("ANSWER: 1")));
    let tree_config = TreeIndexConfig { num_children: 2, ..TreeIndexConfig::default() };
    let leaves = vec![Node::with_id("L1", "leaf one"), Node::with_id("L2", "leaf two")];
    let index = TreeIndex::from_nodes(
        leaves,
        StorageContext::from_defaults(),
        settings.clone(),
        tree_config.clone(),
    )
    .await
    .unwrap();
    index.storage_context().persist(dir.path()).await.unwrap();

    let root_count_after_insert = |index: Box<dyn Index>| async move {
        index.insert_nodes(vec![Node::with_id("L3", "leaf three")]).await.unwrap();
        let IndexStruct::Tree(graph) = index.index_struct() else { panic!("not a tree") };
        graph.root_nodes.len()
    };

    let configs = IndexConfigs { tree: tree_config, ..IndexConfigs::default() };
    let storage = StorageContext::from_persist_dir(dir.path()).unwrap();
    let reloaded = load_index_from_storage_with(storage, "", settings.clone(), configs).unwrap();
    // three roots exceed num_children = 2 and get split under two summaries
    assert_eq!(root_count_after_insert(reloaded).await, 2);

    let storage = StorageContext::from_persist_dir(dir.path()).unwrap();
    let defaulted = load_index_from_storage(storage, "", settings).unwrap();
    assert_eq!(root_count_after_insert(defaulted).await, 3);
}

#[tokio::test]
async fn persisted_vector_index_reloads_by_tag() {
    let dir = tempfile::tempdir().unwrap();
    let documents = vec![
        Document::new("a", "Rust has ownership and borrowing."),
        Document::new("b", "Pasta needs salted boiling water."),
    ];
    let index = VectorStoreIndex::from_documents(
        &documents,
        StorageContext::from_defaults(),
        Settings::default(),
        VectorIndexConfig::default(),
    )
    .await
    .unwrap();
    let retriever = index.as_retriever(&RetrieverOptions::new()).unwrap();
    let before = retriever.retrieve_str("pasta water").await.unwrap();
    index.storage_context().persist(dir.path()).await.unwrap();

    let storage = StorageContext::from_persist_dir(dir.path()).unwrap();
    let reloaded = load_index_from_storage(storage, "", Settings::default()).unwrap();
    assert_eq!(reloaded.index_id(), index.index_id());
    let retriever = reloaded.as_retriever(&RetrieverOptions::new()).unwrap();
    let after = retriever.retrieve_str("pasta water").await.unwrap();
    assert_eq!(before[0].id(), after[0].id());
    assert_eq!(after[0].node.ref_doc_id(), Some("b"));
}

#[tokio::test]
async fn bm25_ranks_document_with_both_terms_first() {
    let corpus = [
        "machine learning basics",
        "deep learning networks",
        "machine shop tools",
        "the the the",
        "cooking pasta tonight",
        "weather is sunny",
        "football match results",
        "stock market news",
        "gardening tips spring",
        "learning to paint",
    ];
    let nodes: Vec<Node> =
        corpus.iter().enumerate().map(|(i, text)| Node::with_id(format!("d{i}"), *text)).collect();
    let retriever = Bm25Retriever::from_nodes(nodes, Bm25Config::default(), 10).unwrap();
    let hits = retriever.retrieve_str("machine learning").await.unwrap();

    assert_eq!(hits[0].id(), "d0");
    assert!(hits.iter().all(|h| h.id() != "d3"));
    assert!(hits.iter().all(|h| h.score > 0.0));
}

#[tokio::test]
async fn tree_select_leaf_follows_first_choice() {
    init_tracing();
    let leaves: Vec<Node> = [("L1", "apples"), ("L2", "pears"), ("L3", "wheels"), ("L4", "engines")]
        .into_iter()
        .map(|(id, text)| Node::with_id(id, text))
        .collect();
    let settings = Settings::default().with_llm(Arc::new(MockLlm::fixed("ANSWER: 1")));
    let config = TreeIndexConfig { num_children: 2, ..Default::default() };
    let index = TreeIndex::from_nodes(leaves, StorageContext::from_defaults(), settings, config)
        .await
        .unwrap();

    let retriever = index.as_retriever(&RetrieverOptions::new().mode("select_leaf")).unwrap();
    let hits = retriever.retrieve_str("fruit").await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec!["L1"]);
}

#[tokio::test]
async fn query_engine_answers_with_sources() {
    let settings = Settings::default().with_llm(Arc::new(MockLlm::fixed("Cats purr.")));
    let index = VectorStoreIndex::from_documents(
        &[Document::new("cats", "Cats purr when content.")],
        StorageContext::from_defaults(),
        settings,
        VectorIndexConfig::default(),
    )
    .await
    .unwrap();
    let engine = index.as_query_engine(&RetrieverOptions::new()).unwrap();
    let response = ragweave::QueryEngine::query_str(&engine, "why do cats purr?").await.unwrap();
    assert_eq!(response.response, "Cats purr.");
    assert_eq!(response.source_nodes.len(), 1);
}
