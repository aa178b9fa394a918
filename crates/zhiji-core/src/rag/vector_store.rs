//! Flat inner-product index over normalized chunk embeddings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{DocumentChunk, SearchResult};
use crate::embedding::EmbeddingService;
use crate::error::{Result, ZhijiError};

const INDEX_FILE: &str = "vector_index.json";
const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VectorStoreStats {
    pub total_chunks: usize,
    pub total_sources: usize,
    pub dimensions: usize,
    pub model_id: String,
}

/// On-disk form of the index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    model_id: String,
    dimensions: usize,
    chunks: Vec<DocumentChunk>,
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Default)]
struct Index {
    chunks: Vec<DocumentChunk>,
    vectors: Vec<Vec<f32>>,
}

pub struct VectorStore {
    embedder: Arc<EmbeddingService>,
    index_path: PathBuf,
    inner: RwLock<Index>,
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VectorStore {
    pub fn new(embedder: Arc<EmbeddingService>, index_dir: impl AsRef<Path>) -> Self {
        Self {
            embedder,
            index_path: index_dir.as_ref().join(INDEX_FILE),
            inner: RwLock::new(Index::default()),
        }
    }

    pub fn embedder(&self) -> &EmbeddingService {
        &self.embedder
    }

    /// Embed and append chunks. Returns the number added.
    pub async fn add_chunks(&self, chunks: Vec<DocumentChunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<&str> = batch.iter().map(|c| c.content.as_str()).collect();
            let embedded = self.embedder.embed_batch(&texts).await?;
            vectors.extend(embedded.into_iter().map(normalize));
        }
        let dims = self.embedder.dimensions();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(ZhijiError::Embedding(format!(
                "embedding has {} dimensions, index expects {dims}",
                bad.len()
            )));
        }

        let added = chunks.len();
        let mut index = self.inner.write().await;
        index.chunks.extend(chunks);
        index.vectors.extend(vectors);
        tracing::debug!(added, total = index.chunks.len(), "indexed chunks");
        Ok(added)
    }

    /// Drop every chunk that came from `source_file`. Returns the number removed.
    pub async fn remove_source(&self, source_file: &str) -> usize {
        let mut index = self.inner.write().await;
        let before = index.chunks.len();
        let taken = std::mem::take(&mut *index);
        let (chunks, vectors): (Vec<_>, Vec<_>) = taken
            .chunks
            .into_iter()
            .zip(taken.vectors)
            .filter(|(c, _)| c.source_file != source_file)
            .unzip();
        index.chunks = chunks;
        index.vectors = vectors;
        before - index.chunks.len()
    }

    /// Top `top_n` chunks by inner product with the normalized query embedding.
    pub async fn search(&self, query: &str, top_n: usize) -> Result<Vec<SearchResult>> {
        if top_n == 0 || self.is_empty().await {
            return Ok(Vec::new());
        }
        let query_vec = normalize(self.embedder.embed(query).await?);

        let index = self.inner.read().await;
        let mut scored: Vec<(usize, f32)> = index
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(&query_vec, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_n);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (i, score))| SearchResult {
                chunk: index.chunks[i].clone(),
                score,
                rank: rank + 1,
            })
            .collect())
    }

    /// Load the persisted index. Returns false when there is nothing usable;
    /// an index built with another embedding model is discarded.
    pub async fn load(&self) -> Result<bool> {
        let bytes = match tokio::fs::read(&self.index_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedIndex = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %self.index_path.display(), "discarding corrupt vector index: {e}");
                return Ok(false);
            }
        };
        if persisted.model_id != self.embedder.model_id()
            || persisted.dimensions != self.embedder.dimensions()
            || persisted.chunks.len() != persisted.vectors.len()
        {
            tracing::warn!(
                stored = %persisted.model_id,
                current = %self.embedder.model_id(),
                "vector index was built with a different model, rebuilding"
            );
            return Ok(false);
        }

        let mut index = self.inner.write().await;
        index.chunks = persisted.chunks;
        index.vectors = persisted.vectors;
        tracing::info!(chunks = index.chunks.len(), "loaded vector index");
        Ok(true)
    }

    pub async fn save(&self) -> Result<()> {
        let index = self.inner.read().await;
        let persisted = PersistedIndex {
            model_id: self.embedder.model_id().to_string(),
            dimensions: self.embedder.dimensions(),
            chunks: index.chunks.clone(),
            vectors: index.vectors.clone(),
        };
        drop(index);
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.index_path, serde_json::to_vec(&persisted)?).await?;
        Ok(())
    }

    pub async fn clear(&self) {
        let mut index = self.inner.write().await;
        index.chunks.clear();
        index.vectors.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> VectorStoreStats {
        let index = self.inner.read().await;
        let mut sources: Vec<&str> = index.chunks.iter().map(|c| c.source_file.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        VectorStoreStats {
            total_chunks: index.chunks.len(),
            total_sources: sources.len(),
            dimensions: self.embedder.dimensions(),
            model_id: self.embedder.model_id().to_string(),
        }
    }
}
