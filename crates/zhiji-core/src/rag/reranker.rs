//! Cross-encoder reranking of retrieved candidates.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{self, RerankConfig};
use crate::error::{Result, ZhijiError};

/// Boxed future returned by [`Reranker`]; keeps the trait object-safe.
pub type RerankFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<(usize, f32)>>> + Send + 'a>>;

/// Scores (query, document) pairs jointly.
pub trait Reranker: Send + Sync {
    /// Returns `(candidate_index, score)` pairs sorted by score descending.
    fn rerank<'a>(&'a self, query: &'a str, documents: &'a [&'a str]) -> RerankFuture<'a>;

    fn model_id(&self) -> &str;
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [&'a str],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f32,
}

/// Client for a `/rerank` endpoint (Jina/SiliconFlow/TEI style).
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    /// `None` when reranking is disabled or no endpoint is configured.
    pub fn from_config(config: &RerankConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(base_url) = config.base_url.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let api_key = config::resolve_api_key(
            config.api_key.as_deref(),
            config.env_var.as_deref(),
            "RERANK_API_KEY",
            "rerank",
            "rerank",
        )
        .ok();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ZhijiError::Config(format!("failed to build rerank client: {e}")))?;
        Ok(Some(Self {
            client,
            url: format!("{}/rerank", base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        }))
    }
}

impl Reranker for HttpReranker {
    fn rerank<'a>(&'a self, query: &'a str, documents: &'a [&'a str]) -> RerankFuture<'a> {
        Box::pin(async move {
            if documents.is_empty() {
                return Ok(Vec::new());
            }
            let mut request = self.client.post(&self.url).json(&RerankRequest {
                model: &self.model,
                query,
                documents,
            });
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ZhijiError::Search(format!("rerank returned {status}: {body}")));
            }
            let parsed: RerankResponse = response.json().await?;
            let mut scored: Vec<(usize, f32)> = parsed
                .results
                .into_iter()
                .filter(|item| item.index < documents.len())
                .map(|item| (item.index, item.relevance_score))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok(scored)
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
