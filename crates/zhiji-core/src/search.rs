//! Web search through SerpAPI.
//!
//! The graph treats search as best-effort: [`SearchService::search`] always
//! returns text, either formatted results or a short explanation of why
//! there are none.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{self, SearchConfig, TimeoutConfig};
use crate::error::{Result, ZhijiError};
use crate::retry::with_retry;

pub const SEARCH_TRIGGERS: &[&str] = &[
    "什么是", "如何", "为什么", "怎么办", "最新", "现在", "今天", "新闻", "天气", "查询", "搜索",
];

pub const DISABLED_MESSAGE: &str = "⚠️ [搜索功能未启用: 未设置 SERPAPI_KEY]";
pub const NO_RESULTS_MESSAGE: &str = "未找到相关搜索结果";

const RETRY_BASE_DELAY_MS: u64 = 500;

/// Whether `text` contains a phrase that usually calls for fresh information.
pub fn should_search(text: &str) -> bool {
    SEARCH_TRIGGERS.iter().any(|t| text.contains(t))
}

#[derive(Debug, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Debug, Default, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

fn format_results(results: &[OrganicResult], max_results: usize) -> String {
    let blocks: Vec<String> = results
        .iter()
        .take(max_results)
        .map(|r| {
            format!(
                "标题: {}\n摘要: {}\n链接: {}",
                r.title.trim(),
                r.snippet.trim(),
                r.link.trim()
            )
        })
        .collect();
    if blocks.is_empty() {
        NO_RESULTS_MESSAGE.to_string()
    } else {
        blocks.join("\n\n")
    }
}

pub struct SearchService {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    max_results: usize,
    language: String,
    timeout_secs: u64,
    retries: usize,
}

impl SearchService {
    /// A missing API key is not an error; the service then reports itself
    /// as disabled on every call.
    pub fn from_config(config: &SearchConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let api_key = if config.enabled {
            config::resolve_api_key(
                config.api_key.as_deref(),
                config.env_var.as_deref(),
                "SERPAPI_KEY",
                "serpapi",
                "search",
            )
            .ok()
        } else {
            None
        };
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ZhijiError::Config(format!("failed to build search client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            endpoint: config.endpoint.clone(),
            max_results: config.max_results,
            language: config.language.clone(),
            timeout_secs: timeouts.search,
            retries: timeouts.search_retries.saturating_sub(1),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn search(&self, query: &str) -> String {
        let Some(api_key) = &self.api_key else {
            return DISABLED_MESSAGE.to_string();
        };
        tracing::info!(query, "web search");
        match with_retry(self.retries, RETRY_BASE_DELAY_MS, || self.fetch(query, api_key)).await {
            Ok(text) => text,
            Err(ZhijiError::Timeout(_)) => {
                tracing::warn!("web search timed out");
                "搜索服务暂时不可用，请稍后重试。原因：连接超时。".to_string()
            }
            Err(e) => {
                tracing::warn!("web search failed: {e}");
                format!("搜索服务遇到问题: {e}")
            }
        }
    }

    fn request(&self, query: &str, api_key: &str) -> reqwest::RequestBuilder {
        let num = self.max_results.to_string();
        self.client.get(&self.endpoint).query(&[
            ("q", query),
            ("api_key", api_key),
            ("hl", self.language.as_str()),
            ("num", num.as_str()),
        ])
    }

    async fn fetch(&self, query: &str, api_key: &str) -> Result<String> {
        let request = self.request(query, api_key).send();
        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), request)
            .await
            .map_err(|_| ZhijiError::Timeout(format!("web search after {}s", self.timeout_secs)))??;
        let status = response.status();
        if !status.is_success() {
            return Err(ZhijiError::Search(format!("serpapi returned {status}")));
        }
        let body: SerpResponse = response.json().await?;
        tracing::debug!(results = body.organic_results.len(), "web search results");
        Ok(format_results(&body.organic_results, self.max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(api_key: Option<&str>, endpoint: &str) -> SearchService {
        let config = SearchConfig {
            api_key: api_key.map(str::to_string),
            env_var: Some("ZHIJI_TEST_UNSET_SEARCH_KEY".into()),
            endpoint: endpoint.to_string(),
            ..Default::default()
        };
        let timeouts = TimeoutConfig {
            search: 2,
            ..Default::default()
        };
        SearchService::from_config(&config, &timeouts).unwrap()
    }

    #[test]
    fn test_should_search() {
        assert!(should_search("什么是正念冥想"));
        assert!(should_search("今天天气怎么样"));
        assert!(!should_search("我有点难过"));
    }

    #[test]
    fn test_format_results_limits_and_trims() {
        let results = vec![
            OrganicResult {
                title: " 正念 ".into(),
                snippet: "一种练习".into(),
                link: "https://a.example".into(),
            },
            OrganicResult::default(),
            OrganicResult::default(),
        ];
        let text = format_results(&results, 2);
        assert!(text.starts_with("标题: 正念\n摘要: 一种练习\n链接: https://a.example"));
        assert_eq!(text.matches("标题:").count(), 2);
        assert_eq!(format_results(&[], 3), NO_RESULTS_MESSAGE);
    }

    #[test]
    fn test_response_without_results_field() {
        let parsed: SerpResponse = serde_json::from_str(r#"{"search_metadata": {}}"#).unwrap();
        assert!(parsed.organic_results.is_empty());
    }

    #[test]
    fn test_request_query_string() {
        let search = service(Some("key"), "https://serpapi.com/search");
        let request = search.request("什么是正念", "key").build().unwrap();
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(request.url().path(), "/search");
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "什么是正念".to_string()),
                ("api_key".to_string(), "key".to_string()),
                ("hl".to_string(), "zh-cn".to_string()),
                ("num".to_string(), "3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_disabled() {
        let search = service(None, "https://serpapi.com/search");
        assert!(!search.is_enabled());
        assert_eq!(search.search("新闻").await, DISABLED_MESSAGE);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades() {
        let search = service(Some("key"), "http://127.0.0.1:9/search");
        let text = search.search("新闻").await;
        assert!(!text.is_empty());
        assert_ne!(text, DISABLED_MESSAGE);
    }
}
