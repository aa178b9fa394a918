mod hash;
mod provider;

pub use hash::HashEmbeddingProvider;
pub use provider::EmbeddingProvider;

use crate::config::{self, EmbeddingConfig};
use crate::error::{Result, ZhijiError};
use crate::retry::with_retry;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returning raw Rig embeddings.
type EmbedFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<Vec<f64>>, String>> + Send + 'a>>;

/// Object-safe wrapper for Rig's `EmbeddingModel`, which is not
/// dyn-compatible on its own.
trait RigEmbedAdapter: Send + Sync {
    fn embed_texts(&self, texts: Vec<String>) -> EmbedFuture<'_>;

    fn model_id(&self) -> &str;
}

impl<M> RigEmbedAdapter for RigModelWrapper<M>
where
    M: rig::embeddings::EmbeddingModel + Send + Sync + 'static,
{
    fn embed_texts(&self, texts: Vec<String>) -> EmbedFuture<'_> {
        Box::pin(async move {
            let embeddings = self
                .model
                .embed_texts(texts)
                .await
                .map_err(|e| e.to_string())?;
            Ok(embeddings.into_iter().map(|e| e.vec).collect())
        })
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}

struct RigModelWrapper<M> {
    model: M,
    model_name: String,
}

enum EmbeddingInner {
    /// Remote provider through Rig (OpenAI-compatible or Ollama).
    Rig(Box<dyn RigEmbedAdapter>),
    /// Offline feature hashing.
    Hash(HashEmbeddingProvider),
}

/// Embedding service used by the knowledge-base vector store.
pub struct EmbeddingService {
    inner: EmbeddingInner,
    provider: &'static str,
    dimensions: usize,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("provider", &self.provider)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// Pick the configured model unless it is still the hash default.
fn remote_model_name(config: &EmbeddingConfig, fallback: &str) -> String {
    if config.model == "hash-128d" {
        fallback.to_string()
    } else {
        config.model.clone()
    }
}

fn build_error(provider: &str, e: impl std::fmt::Display) -> ZhijiError {
    ZhijiError::Embedding(format!("failed to build {provider} client: {e}"))
}

impl EmbeddingService {
    fn rig<M>(model: M, model_name: String, provider: &'static str, dimensions: usize) -> Self
    where
        M: rig::embeddings::EmbeddingModel + Send + Sync + 'static,
    {
        Self {
            inner: EmbeddingInner::Rig(Box::new(RigModelWrapper { model, model_name })),
            provider,
            dimensions,
        }
    }

    /// Create an embedding service from configuration.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        use rig::prelude::EmbeddingsClient;

        match config.provider.as_str() {
            "openai" => {
                let api_key = config::resolve_api_key(
                    config.api_key.as_deref(),
                    config.env_var.as_deref(),
                    "OPENAI_API_KEY",
                    "openai",
                    "embedding",
                )?;
                let model_name = remote_model_name(config, "text-embedding-3-small");
                let dims = config.dimensions.unwrap_or(1536);

                let mut builder =
                    rig::providers::openai::Client::<reqwest::Client>::builder().api_key(&api_key);
                if let Some(ref base_url) = config.base_url {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build().map_err(|e| build_error("OpenAI", e))?;
                let model = client.embedding_model_with_ndims(&model_name, dims);

                Ok(Self::rig(model, model_name, "openai", dims))
            }

            "ollama" => {
                let model_name = remote_model_name(config, "nomic-embed-text");
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                let dims = config.dimensions.unwrap_or(768);

                let client = rig::providers::ollama::Client::<reqwest::Client>::builder()
                    .api_key(rig::client::Nothing)
                    .base_url(&base_url)
                    .build()
                    .map_err(|e| build_error("Ollama", e))?;
                let model = client.embedding_model_with_ndims(&model_name, dims);

                Ok(Self::rig(model, model_name, "ollama", dims))
            }

            "hash" => Ok(Self {
                inner: EmbeddingInner::Hash(HashEmbeddingProvider::new()),
                provider: "hash",
                dimensions: 128,
            }),

            other => Err(ZhijiError::Config(format!(
                "unknown embedding provider: '{other}' \
                 (expected 'openai', 'ollama', or 'hash')"
            ))),
        }
    }

    /// The offline hash embedder.
    pub fn hash() -> Self {
        Self {
            inner: EmbeddingInner::Hash(HashEmbeddingProvider::new()),
            provider: "hash",
            dimensions: 128,
        }
    }

    /// Embed a single text. Remote providers retry transient failures.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed_batch(&[text]).await?;
        vecs.pop()
            .ok_or_else(|| ZhijiError::Embedding("empty embedding result".into()))
    }

    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hash(p) => p.embed_batch(texts).await,
            EmbeddingInner::Rig(adapter) => {
                with_retry(3, 200, || async {
                    let owned: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
                    let vecs = adapter
                        .embed_texts(owned)
                        .await
                        .map_err(ZhijiError::Embedding)?;
                    if vecs.len() != texts.len() {
                        return Err(ZhijiError::Embedding(format!(
                            "expected {} embeddings, got {}",
                            texts.len(),
                            vecs.len()
                        )));
                    }
                    Ok(vecs
                        .into_iter()
                        .map(|v| v.into_iter().map(|x| x as f32).collect())
                        .collect())
                })
                .await
            }
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_id(&self) -> &str {
        match &self.inner {
            EmbeddingInner::Rig(adapter) => adapter.model_id(),
            EmbeddingInner::Hash(p) => p.model_id(),
        }
    }

    /// Provider name for display purposes.
    pub fn provider_name(&self) -> &str {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, model: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            model: model.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_provider_errors() {
        let err = EmbeddingService::from_config(&config("nonexistent", "x")).unwrap_err();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn test_ollama_no_auth_required() {
        let service = EmbeddingService::from_config(&config("ollama", "bge-m3")).unwrap();
        assert_eq!(service.model_id(), "bge-m3");
        assert_eq!(service.provider_name(), "ollama");
    }

    #[test]
    fn test_ollama_default_model_override() {
        let service = EmbeddingService::from_config(&config("ollama", "hash-128d")).unwrap();
        assert_eq!(service.model_id(), "nomic-embed-text");
        assert_eq!(service.dimensions(), 768);
    }

    #[test]
    fn test_openai_custom_base_url() {
        let cfg = EmbeddingConfig {
            api_key: Some("dummy-key".into()),
            base_url: Some("http://localhost:8000/v1".into()),
            dimensions: Some(1024),
            ..config("openai", "BAAI/bge-large-zh-v1.5")
        };
        let service = EmbeddingService::from_config(&cfg).unwrap();
        assert_eq!(service.dimensions(), 1024);
        assert_eq!(service.model_id(), "BAAI/bge-large-zh-v1.5");
    }

    #[test]
    fn test_openai_without_key_errors() {
        let cfg = EmbeddingConfig {
            env_var: Some("ZHIJI_TEST_NO_EMBEDDING_KEY".into()),
            ..config("openai", "text-embedding-3-small")
        };
        let err = EmbeddingService::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_unsupported_vendor_names_error() {
        for provider in ["gemini", "cohere"] {
            let cfg = EmbeddingConfig {
                api_key: Some("k".into()),
                ..config(provider, "x")
            };
            let err = EmbeddingService::from_config(&cfg).unwrap_err();
            assert!(err.to_string().contains("unknown embedding provider"));
        }
    }

    #[tokio::test]
    async fn test_hash_service_embeds() {
        let service = EmbeddingService::from_config(&config("hash", "hash-128d")).unwrap();
        assert_eq!(service.dimensions(), 128);
        let batch = service.embed_batch(&["抑郁", "焦虑"]).await.unwrap();
        assert_eq!(batch.len(), 2);
        let single = service.embed("抑郁").await.unwrap();
        assert_eq!(single, batch[0]);
    }
}
