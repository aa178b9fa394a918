//! Two-stage retrieval: coarse vector search, then optional reranking.

use std::collections::HashSet;
use std::sync::Arc;

use super::reranker::Reranker;
use super::vector_store::VectorStore;
use super::RerankedResult;
use crate::error::Result;

pub struct Retriever {
    store: Arc<VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    coarse_top_n: usize,
}

/// Number of coarse candidates to fetch for `top_k` final results.
pub fn coarse_count(top_k: usize, configured: usize) -> usize {
    configured.max(top_k * 2).max(10)
}

impl Retriever {
    pub fn new(
        store: Arc<VectorStore>,
        reranker: Option<Arc<dyn Reranker>>,
        coarse_top_n: usize,
    ) -> Self {
        Self {
            store,
            reranker,
            coarse_top_n,
        }
    }

    pub fn rerank_enabled(&self) -> bool {
        self.reranker.is_some()
    }

    /// Retrieve the `top_k` best chunks for `query`.
    ///
    /// Reranking failures are logged and fall back to similarity order.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        use_rerank: bool,
        candidates: Option<usize>,
    ) -> Result<Vec<RerankedResult>> {
        let coarse_n = candidates.unwrap_or_else(|| coarse_count(top_k, self.coarse_top_n));
        let coarse = self.store.search(query, coarse_n).await?;
        if coarse.is_empty() {
            return Ok(Vec::new());
        }

        if use_rerank {
            if let Some(reranker) = &self.reranker {
                let documents: Vec<&str> = coarse.iter().map(|r| r.chunk.content.as_str()).collect();
                match reranker.rerank(query, &documents).await {
                    Ok(scored) if !scored.is_empty() => {
                        // First (best) score wins for a repeated index.
                        let mut seen = HashSet::new();
                        return Ok(scored
                            .into_iter()
                            .filter(|(i, _)| seen.insert(*i))
                            .filter_map(|(i, score)| coarse.get(i).map(|r| (r, score)))
                            .take(top_k)
                            .enumerate()
                            .map(|(rank, (r, score))| RerankedResult {
                                chunk: r.chunk.clone(),
                                similarity_score: r.score,
                                rerank_score: Some(score),
                                final_rank: rank + 1,
                            })
                            .collect());
                    }
                    Ok(_) => tracing::warn!("reranker returned no scores, using similarity order"),
                    Err(e) => tracing::warn!("rerank failed, using similarity order: {e}"),
                }
            }
        }

        Ok(coarse
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(rank, r)| RerankedResult {
                chunk: r.chunk,
                similarity_score: r.score,
                rerank_score: None,
                final_rank: rank + 1,
            })
            .collect())
    }

    /// Retrieved chunks formatted as numbered prompt context. Empty when
    /// nothing is found.
    pub async fn context_for_query(&self, query: &str, top_k: usize, use_rerank: bool) -> Result<String> {
        let results = self.search(query, top_k, use_rerank, None).await?;
        Ok(format_context(&results))
    }
}

pub fn format_context(results: &[RerankedResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[文档{}] 来源: {}\n{}\n", i + 1, r.chunk.source_file, r.chunk.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingService;
    use crate::error::ZhijiError;
    use crate::rag::chunker::split_into_chunks;
    use crate::rag::reranker::RerankFuture;

    /// Scores documents by how many characters of `favored` they contain.
    struct FavoringReranker {
        favored: &'static str,
    }

    impl Reranker for FavoringReranker {
        fn rerank<'a>(&'a self, _query: &'a str, documents: &'a [&'a str]) -> RerankFuture<'a> {
            Box::pin(async move {
                let mut scored: Vec<(usize, f32)> = documents
                    .iter()
                    .enumerate()
                    .map(|(i, d)| (i, self.favored.chars().filter(|c| d.contains(*c)).count() as f32))
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                Ok(scored)
            })
        }

        fn model_id(&self) -> &str {
            "favoring"
        }
    }

    struct BrokenReranker;

    impl Reranker for BrokenReranker {
        fn rerank<'a>(&'a self, _query: &'a str, _documents: &'a [&'a str]) -> RerankFuture<'a> {
            Box::pin(async { Err(ZhijiError::Search("503 service unavailable".into())) })
        }

        fn model_id(&self) -> &str {
            "broken"
        }
    }

    /// Reports the first candidate three times.
    struct RepeatingReranker;

    impl Reranker for RepeatingReranker {
        fn rerank<'a>(&'a self, _query: &'a str, _documents: &'a [&'a str]) -> RerankFuture<'a> {
            Box::pin(async { Ok(vec![(0, 0.9), (0, 0.8), (0, 0.7), (2, 0.5), (1, 0.4)]) })
        }

        fn model_id(&self) -> &str {
            "repeating"
        }
    }

    async fn store() -> Arc<VectorStore> {
        let dir = std::env::temp_dir().join(format!("zhiji-retr-{}", uuid::Uuid::now_v7()));
        let store = VectorStore::new(Arc::new(EmbeddingService::hash()), dir);
        let mut chunks = Vec::new();
        for (text, file) in [
            ("焦虑时可以尝试深呼吸练习", "a.md"),
            ("焦虑和压力常常一起出现", "b.md"),
            ("运动有助于缓解焦虑情绪", "c.md"),
            ("规律作息改善睡眠质量", "d.md"),
        ] {
            chunks.extend(split_into_chunks(text, file, 512, 50));
        }
        store.add_chunks(chunks).await.unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_coarse_count() {
        assert_eq!(coarse_count(3, 6), 10);
        assert_eq!(coarse_count(8, 6), 16);
        assert_eq!(coarse_count(3, 20), 20);
    }

    #[tokio::test]
    async fn test_without_rerank_keeps_similarity_order() {
        let store = store().await;
        let coarse = store.search("焦虑怎么办", 2).await.unwrap();
        let retriever = Retriever::new(store, None, 6);
        let results = retriever.search("焦虑怎么办", 2, true, None).await.unwrap();
        assert_eq!(results.len(), 2);
        for (r, c) in results.iter().zip(&coarse) {
            assert_eq!(r.chunk.chunk_id, c.chunk.chunk_id);
            assert!(r.rerank_score.is_none());
        }
        assert_eq!(results[1].final_rank, 2);
    }

    #[tokio::test]
    async fn test_rerank_reorders() {
        let retriever = Retriever::new(
            store().await,
            Some(Arc::new(FavoringReranker { favored: "运动" })),
            6,
        );
        let results = retriever.search("焦虑怎么办", 1, true, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_file, "c.md");
        assert_eq!(results[0].rerank_score, Some(2.0));
    }

    #[tokio::test]
    async fn test_rerank_not_requested() {
        let retriever = Retriever::new(
            store().await,
            Some(Arc::new(FavoringReranker { favored: "运动" })),
            6,
        );
        let results = retriever.search("焦虑怎么办", 2, false, None).await.unwrap();
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_rerank_failure_falls_back() {
        let retriever = Retriever::new(store().await, Some(Arc::new(BrokenReranker)), 6);
        let results = retriever.search("焦虑怎么办", 3, true, None).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_repeated_rerank_index_appears_once() {
        let store = store().await;
        let coarse = store.search("焦虑怎么办", 10).await.unwrap();
        let retriever = Retriever::new(store, Some(Arc::new(RepeatingReranker)), 6);
        let results = retriever.search("焦虑怎么办", 3, true, None).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                coarse[0].chunk.chunk_id.as_str(),
                coarse[2].chunk.chunk_id.as_str(),
                coarse[1].chunk.chunk_id.as_str(),
            ]
        );
        assert_eq!(results[0].rerank_score, Some(0.9));
        assert_eq!(results[2].final_rank, 3);
    }

    #[tokio::test]
    async fn test_context_format() {
        let retriever = Retriever::new(store().await, None, 6);
        let context = retriever.context_for_query("睡眠", 1, false).await.unwrap();
        assert!(context.starts_with("[文档1] 来源: "));
        assert!(context.ends_with('\n'));
    }
}
