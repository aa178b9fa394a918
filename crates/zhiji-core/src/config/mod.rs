use crate::error::{Result, ZhijiError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZhijiConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the JSON data tree (sessions, messages, plans, events, users).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            env_var: None,
            max_tokens: default_llm_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default)]
    pub env_var: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            api_key: None,
            base_url: None,
            dimensions: None,
            env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_knowledge_dir")]
    pub knowledge_dir: String,
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Candidates fetched before reranking. The retriever never fetches fewer
    /// than `max(top_k * 2, 10)`.
    #[serde(default = "default_coarse_top_n")]
    pub coarse_top_n: usize,
    #[serde(default = "default_rag_top_k")]
    pub top_k: usize,
    /// Apply the reranker to retrieval results when one is configured.
    #[serde(default = "default_true")]
    pub rerank: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            knowledge_dir: default_knowledge_dir(),
            index_dir: default_index_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            coarse_top_n: default_coarse_top_n(),
            top_k: default_rag_top_k(),
            rerank: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            model: default_rerank_model(),
            api_key: None,
            env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_language")]
    pub language: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            env_var: None,
            endpoint: default_search_endpoint(),
            max_results: default_search_max_results(),
            language: default_search_language(),
        }
    }
}

/// Feature switches for the conversation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_true")]
    pub guided_inquiry: bool,
    #[serde(default = "default_true")]
    pub pattern_analysis: bool,
    #[serde(default = "default_true")]
    pub analysis_report: bool,
    /// History messages passed to the response prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Background event extraction runs after every N-th user message.
    #[serde(default = "default_every_three")]
    pub event_every: usize,
    /// A long-term memory is written on every N-th emotion record.
    #[serde(default = "default_every_three")]
    pub long_term_every: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            guided_inquiry: true,
            pattern_analysis: true,
            analysis_report: true,
            history_window: default_history_window(),
            event_every: default_every_three(),
            long_term_every: default_every_three(),
        }
    }
}

/// Per-call-site timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_search_timeout")]
    pub search: u64,
    #[serde(default = "default_search_retries")]
    pub search_retries: usize,
    #[serde(default = "default_chat_timeout")]
    pub chat: u64,
    #[serde(default = "default_short_timeout")]
    pub mood: u64,
    #[serde(default = "default_short_timeout")]
    pub event: u64,
    #[serde(default = "default_analysis_timeout")]
    pub analysis: u64,
    #[serde(default = "default_plan_retries")]
    pub plan_retries: usize,
    #[serde(default = "default_db_timeout")]
    pub db: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search: default_search_timeout(),
            search_retries: default_search_retries(),
            chat: default_chat_timeout(),
            mood: default_short_timeout(),
            event: default_short_timeout(),
            analysis: default_analysis_timeout(),
            plan_retries: default_plan_retries(),
            db: default_db_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_host")]
    pub host: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            host: default_web_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Append one JSONL record per chat turn.
    #[serde(default = "default_true")]
    pub chat_log: bool,
    /// Defaults to `<data_dir>/logs`.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            chat_log: true,
            dir: None,
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_true() -> bool {
    true
}
fn default_llm_provider() -> String {
    "deepseek".to_string()
}
fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}
fn default_llm_max_tokens() -> usize {
    2000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_model() -> String {
    "hash-128d".to_string()
}
fn default_knowledge_dir() -> String {
    "knowledge_base".to_string()
}
fn default_index_dir() -> String {
    "rag_index".to_string()
}
fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_coarse_top_n() -> usize {
    6
}
fn default_rag_top_k() -> usize {
    3
}
fn default_rerank_model() -> String {
    "BAAI/bge-reranker-v2-m3".to_string()
}
fn default_search_endpoint() -> String {
    "https://serpapi.com/search".to_string()
}
fn default_search_max_results() -> usize {
    3
}
fn default_search_language() -> String {
    "zh-cn".to_string()
}
fn default_history_window() -> usize {
    10
}
fn default_every_three() -> usize {
    3
}
fn default_search_timeout() -> u64 {
    15
}
fn default_search_retries() -> usize {
    2
}
fn default_chat_timeout() -> u64 {
    60
}
fn default_short_timeout() -> u64 {
    45
}
fn default_analysis_timeout() -> u64 {
    120
}
fn default_plan_retries() -> usize {
    2
}
fn default_db_timeout() -> u64 {
    30
}
fn default_web_port() -> u16 {
    5858
}
fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

/// Valid LLM provider names. `deepseek` speaks the OpenAI chat protocol.
pub const VALID_LLM_PROVIDERS: &[&str] = &["ollama", "openai", "deepseek", "gemini", "anthropic"];

/// Valid embedding provider names.
pub const VALID_PROVIDERS: &[&str] = &["hash", "ollama", "openai"];

impl ZhijiConfig {
    /// Load configuration with three-layer TOML merge plus environment:
    /// 1. ~/.config/zhiji/config.toml (global)
    /// 2. .zhiji/config.toml (project)
    /// 3. .zhiji/config.local.toml (local, gitignored)
    /// 4. `ZHIJI__SECTION__KEY` environment variables
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        if let Some(dir) = project_dir {
            let project_config = dir.join(".zhiji").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            let local_config = dir.join(".zhiji").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ZHIJI")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ZhijiError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| ZhijiError::Config(e.to_string()))?;

        cfg.validate();
        Ok(cfg)
    }

    /// Defaults only (no files, no environment).
    pub fn default_config() -> Self {
        Self {
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            rag: RagConfig::default(),
            rerank: RerankConfig::default(),
            search: SearchConfig::default(),
            chat: ChatConfig::default(),
            timeouts: TimeoutConfig::default(),
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate config values, clamping out-of-range values and logging warnings.
    /// Lenient: values are fixed rather than rejected.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !VALID_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            warnings.push(format!(
                "unknown embedding provider '{}', valid: {}",
                self.embedding.provider,
                VALID_PROVIDERS.join(", ")
            ));
        }

        if self.llm.enabled && !VALID_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            warnings.push(format!(
                "unknown LLM provider '{}', valid: {}",
                self.llm.provider,
                VALID_LLM_PROVIDERS.join(", ")
            ));
        }

        if self.llm.max_tokens == 0 {
            warnings.push("llm.max_tokens = 0, setting to 256".to_string());
            self.llm.max_tokens = 256;
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            warnings.push(format!(
                "llm.temperature = {} out of range [0.0, 2.0], clamping",
                self.llm.temperature
            ));
            self.llm.temperature = self.llm.temperature.clamp(0.0, 2.0);
        }

        if self.rag.chunk_size == 0 {
            warnings.push("rag.chunk_size = 0, setting to 512".to_string());
            self.rag.chunk_size = default_chunk_size();
        }
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            let fixed = self.rag.chunk_size / 10;
            warnings.push(format!(
                "rag.chunk_overlap ({}) >= rag.chunk_size ({}), setting to {fixed}",
                self.rag.chunk_overlap, self.rag.chunk_size
            ));
            self.rag.chunk_overlap = fixed;
        }

        let positive_checks: Vec<(&str, &mut usize)> = vec![
            ("rag.top_k", &mut self.rag.top_k),
            ("rag.coarse_top_n", &mut self.rag.coarse_top_n),
            ("search.max_results", &mut self.search.max_results),
            ("chat.history_window", &mut self.chat.history_window),
            ("chat.event_every", &mut self.chat.event_every),
            ("chat.long_term_every", &mut self.chat.long_term_every),
        ];
        for (name, val) in positive_checks {
            if *val == 0 {
                warnings.push(format!("{name} = 0, setting to 1"));
                *val = 1;
            }
        }

        let timeout_checks: Vec<(&str, &mut u64)> = vec![
            ("timeouts.search", &mut self.timeouts.search),
            ("timeouts.chat", &mut self.timeouts.chat),
            ("timeouts.mood", &mut self.timeouts.mood),
            ("timeouts.event", &mut self.timeouts.event),
            ("timeouts.analysis", &mut self.timeouts.analysis),
            ("timeouts.db", &mut self.timeouts.db),
        ];
        for (name, val) in timeout_checks {
            if *val == 0 {
                warnings.push(format!("{name} = 0, setting to 1"));
                *val = 1;
            }
        }

        if self.rerank.enabled && self.rerank.base_url.is_none() {
            warnings.push("rerank.enabled = true but rerank.base_url is unset; rerank disabled".into());
            self.rerank.enabled = false;
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }

    /// Directory for the JSONL chat log.
    pub fn chat_log_dir(&self) -> PathBuf {
        match &self.logging.dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.storage.data_dir).join("logs"),
        }
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("zhiji").join("config.toml"))
}

/// Resolve an API key: check config field first, then environment variable.
/// Shared by the LLM, embedding, rerank and search clients.
pub fn resolve_api_key(
    api_key: Option<&str>,
    env_var_override: Option<&str>,
    default_env_var: &str,
    provider_name: &str,
    service_kind: &str,
) -> Result<String> {
    if let Some(key) = api_key {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    let env_var_name = env_var_override.unwrap_or(default_env_var);

    std::env::var(env_var_name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ZhijiError::Config(format!(
                "{provider_name} {service_kind} provider requires an API key \
                 (set {service_kind}.api_key or {env_var_name})"
            ))
        })
}
