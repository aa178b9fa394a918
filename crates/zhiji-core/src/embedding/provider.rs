use crate::error::Result;

/// Trait for local (in-process) embedding providers.
///
/// Remote providers go through Rig inside `EmbeddingService`; this trait
/// covers implementations that need no network, such as
/// [`super::HashEmbeddingProvider`].
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(&self, text: &str) -> impl std::future::Future<Output = Result<Vec<f32>>> + Send;

    /// Generate embeddings for multiple texts in a batch.
    fn embed_batch(
        &self,
        texts: &[&str],
    ) -> impl std::future::Future<Output = Result<Vec<Vec<f32>>>> + Send;

    /// The dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Model identifier stored alongside persisted indexes.
    fn model_id(&self) -> &str;
}
