//! Retrieval-augmented generation over the local knowledge base.
//!
//! [`RagService`] ties the pieces together: the scanner finds new or changed
//! documents, the chunker splits them, the vector store embeds and indexes
//! the chunks, and the retriever answers queries with optional reranking.

pub mod chunker;
pub mod reranker;
pub mod retriever;
pub mod scanner;
pub mod vector_store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ZhijiConfig;
use crate::embedding::EmbeddingService;
use crate::error::Result;

pub use reranker::{HttpReranker, Reranker};
pub use retriever::Retriever;
pub use scanner::{DocumentInfo, KnowledgeScanner, ScanStats};
pub use vector_store::{VectorStore, VectorStoreStats};

/// A window of a knowledge document. Positions are char offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub content: String,
    pub source_file: String,
    pub chunk_index: usize,
    pub start_pos: usize,
    pub end_pos: usize,
}

/// Coarse vector-search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub rank: usize,
}

/// Final retrieval result after the optional rerank stage.
#[derive(Debug, Clone, Serialize)]
pub struct RerankedResult {
    pub chunk: DocumentChunk,
    pub similarity_score: f32,
    pub rerank_score: Option<f32>,
    pub final_rank: usize,
}

/// What an indexing pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_added: usize,
    /// Documents that could not be read or embedded; retried next pass.
    pub files_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagStatistics {
    pub knowledge_base: ScanStats,
    pub vector_store: VectorStoreStats,
    pub is_initialized: bool,
    pub rerank_enabled: bool,
}

pub struct RagService {
    scanner: Mutex<KnowledgeScanner>,
    store: Arc<VectorStore>,
    retriever: Retriever,
    chunk_size: usize,
    chunk_overlap: usize,
    top_k: usize,
    use_rerank: bool,
    initialized: AtomicBool,
}

impl RagService {
    pub fn new(
        config: &ZhijiConfig,
        embedder: Arc<EmbeddingService>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        let rag = &config.rag;
        let store = Arc::new(VectorStore::new(embedder, &rag.index_dir));
        Self {
            scanner: Mutex::new(KnowledgeScanner::new(&rag.knowledge_dir, &rag.index_dir)),
            retriever: Retriever::new(store.clone(), reranker, rag.coarse_top_n),
            store,
            chunk_size: rag.chunk_size,
            chunk_overlap: rag.chunk_overlap,
            top_k: rag.top_k,
            use_rerank: rag.rerank,
            initialized: AtomicBool::new(false),
        }
    }

    /// Build from config, attaching the HTTP reranker when one is configured.
    pub fn from_config(config: &ZhijiConfig, embedder: Arc<EmbeddingService>) -> Result<Self> {
        let reranker = HttpReranker::from_config(&config.rerank)?
            .map(|r| Arc::new(r) as Arc<dyn Reranker>);
        Ok(Self::new(config, embedder, reranker))
    }

    /// Load the persisted index and bring it up to date with the knowledge
    /// directory. Falls back to a full rebuild when no usable index exists.
    pub async fn initialize(&self) -> Result<IndexReport> {
        if !self.store.load().await? {
            return self.rebuild().await;
        }

        let mut scanner = self.scanner.lock().await;
        let scan = scanner.scan()?;
        let mut report = IndexReport::default();

        for path in &scan.removed {
            let label = scanner.source_label(path);
            self.store.remove_source(&label).await;
            report.files_removed += 1;
        }
        for doc in &scan.changed {
            let label = scanner.source_label(&doc.file_path);
            self.store.remove_source(&label).await;
            self.index_or_skip(&mut scanner, doc, &label, &mut report).await;
        }
        if report.files_indexed > 0 || report.files_removed > 0 || report.files_skipped > 0 {
            self.store.save().await?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            indexed = report.files_indexed,
            removed = report.files_removed,
            skipped = report.files_skipped,
            chunks = self.store.len().await,
            "knowledge base ready"
        );
        Ok(report)
    }

    /// Discard the index and re-embed every document.
    pub async fn rebuild(&self) -> Result<IndexReport> {
        let mut scanner = self.scanner.lock().await;
        self.store.clear().await;
        let docs = scanner.all_documents()?;
        let mut report = IndexReport::default();
        for doc in &docs {
            let label = scanner.source_label(&doc.file_path);
            self.index_or_skip(&mut scanner, doc, &label, &mut report).await;
        }
        self.store.save().await?;
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            files = report.files_indexed,
            skipped = report.files_skipped,
            chunks = report.chunks_added,
            "knowledge base rebuilt"
        );
        Ok(report)
    }

    /// One bad document never stops the pass.
    async fn index_or_skip(
        &self,
        scanner: &mut KnowledgeScanner,
        doc: &DocumentInfo,
        label: &str,
        report: &mut IndexReport,
    ) {
        match self.index_document(scanner, doc, label).await {
            Ok(added) => {
                report.chunks_added += added;
                report.files_indexed += 1;
            }
            Err(e) => {
                tracing::warn!(file = %label, "skipping knowledge document: {e}");
                self.store.remove_source(label).await;
                report.files_skipped += 1;
            }
        }
    }

    async fn index_document(
        &self,
        scanner: &mut KnowledgeScanner,
        doc: &DocumentInfo,
        label: &str,
    ) -> Result<usize> {
        let text = scanner.read_document(doc)?;
        let chunks = chunker::split_into_chunks(&text, label, self.chunk_size, self.chunk_overlap);
        let added = self.store.add_chunks(chunks).await?;
        scanner.mark_processed(&doc.file_path, added)?;
        tracing::debug!(file = %label, chunks = added, "indexed document");
        Ok(added)
    }

    /// Two-stage search with the configured `top_k` unless overridden.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<RerankedResult>> {
        self.retriever
            .search(query, top_k.unwrap_or(self.top_k), self.use_rerank, None)
            .await
    }

    pub async fn context_for_query(&self, query: &str) -> Result<String> {
        self.retriever
            .context_for_query(query, self.top_k, self.use_rerank)
            .await
    }

    /// Initialized and holding at least one chunk.
    pub async fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && !self.store.is_empty().await
    }

    pub async fn statistics(&self) -> RagStatistics {
        RagStatistics {
            knowledge_base: self.scanner.lock().await.stats(),
            vector_store: self.store.stats().await,
            is_initialized: self.initialized.load(Ordering::SeqCst),
            rerank_enabled: self.use_rerank && self.retriever.rerank_enabled(),
        }
    }
}
