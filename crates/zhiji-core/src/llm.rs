//! Text generation clients.
//!
//! Everything in the conversation graph talks to an `Arc<dyn TextGenerator>`,
//! so the HTTP-backed [`LlmService`] and the offline [`ScriptedGenerator`]
//! are interchangeable.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{self, LlmConfig};
use crate::error::{Result, ZhijiError};

/// Boxed future returned by [`TextGenerator`]; keeps the trait object-safe.
pub type GenerateFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl LlmRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content: content.into(),
        }
    }
}

/// Object-safe chat completion interface.
pub trait TextGenerator: Send + Sync {
    /// Complete a conversation. The reply is the assistant's next message.
    fn chat<'a>(&'a self, messages: &'a [LlmMessage]) -> GenerateFuture<'a>;

    /// Single-prompt convenience over [`TextGenerator::chat`].
    fn generate<'a>(&'a self, prompt: &'a str, system: Option<&'a str>) -> GenerateFuture<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system {
            messages.push(LlmMessage::system(sys));
        }
        messages.push(LlmMessage::user(prompt));
        Box::pin(async move { self.chat(&messages).await })
    }

    /// Model identifier for logs and the health endpoint.
    fn model_name(&self) -> &str;
}

/// Run a completion bounded by `secs`. Elapsed time maps to [`ZhijiError::Timeout`].
pub async fn chat_with_timeout(
    llm: &dyn TextGenerator,
    messages: &[LlmMessage],
    secs: u64,
    what: &str,
) -> Result<String> {
    match tokio::time::timeout(Duration::from_secs(secs), llm.chat(messages)).await {
        Ok(result) => result,
        Err(_) => Err(ZhijiError::Timeout(format!("{what} after {secs}s"))),
    }
}

/// [`chat_with_timeout`] for a single prompt with an optional system message.
pub async fn generate_with_timeout(
    llm: &dyn TextGenerator,
    prompt: &str,
    system: Option<&str>,
    secs: u64,
    what: &str,
) -> Result<String> {
    let mut messages = Vec::with_capacity(2);
    if let Some(sys) = system {
        messages.push(LlmMessage::system(sys));
    }
    messages.push(LlmMessage::user(prompt));
    chat_with_timeout(llm, &messages, secs, what).await
}

// ---------------------------------------------------------------------------
// HTTP providers
// ---------------------------------------------------------------------------

/// Remote chat completion service (Ollama, OpenAI-compatible, Gemini, Anthropic).
pub struct LlmService {
    provider: LlmProvider,
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for LlmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmService")
            .field("provider", &self.provider)
            .field("model", &self.config.model)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum LlmProvider {
    Ollama,
    /// OpenAI and any service speaking its chat protocol (DeepSeek).
    OpenAi { default_base: &'static str },
    Gemini,
    Anthropic,
}

impl LlmService {
    /// Create an LLM service from configuration. Providers that need a key
    /// fail here rather than on the first request.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let (provider, default_env) = match config.provider.as_str() {
            "ollama" => (LlmProvider::Ollama, None),
            "openai" => (
                LlmProvider::OpenAi {
                    default_base: "https://api.openai.com",
                },
                Some("OPENAI_API_KEY"),
            ),
            "deepseek" => (
                LlmProvider::OpenAi {
                    default_base: "https://api.deepseek.com",
                },
                Some("DEEPSEEK_API_KEY"),
            ),
            "gemini" => (LlmProvider::Gemini, Some("GEMINI_API_KEY")),
            "anthropic" | "claude" => (LlmProvider::Anthropic, Some("ANTHROPIC_API_KEY")),
            other => {
                return Err(ZhijiError::Config(format!(
                    "unknown LLM provider: '{other}' (expected 'ollama', 'openai', 'deepseek', 'gemini', or 'anthropic')"
                )));
            }
        };

        let api_key = match default_env {
            Some(env) => Some(config::resolve_api_key(
                config.api_key.as_deref(),
                config.env_var.as_deref(),
                env,
                &config.provider,
                "llm",
            )?),
            None => None,
        };

        Ok(Self {
            provider,
            config: config.clone(),
            api_key,
            client: reqwest::Client::new(),
        })
    }

    fn base_url<'a>(&'a self, default: &'a str) -> &'a str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
    }

    fn key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    async fn post_json(
        &self,
        label: &str,
        request: reqwest::RequestBuilder,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let resp = request
            .json(body)
            .send()
            .await
            .map_err(|e| ZhijiError::Llm(format!("{label} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ZhijiError::Llm(format!("{label} error {status}: {text}")));
        }

        resp.json()
            .await
            .map_err(|e| ZhijiError::Llm(format!("{label} response parse error: {e}")))
    }

    /// Ollama: POST {base_url}/api/chat
    async fn chat_ollama(&self, messages: &[LlmMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url("http://localhost:11434"));
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": openai_messages(messages),
            "stream": false,
            "options": {
                "num_predict": self.config.max_tokens,
                "temperature": self.config.temperature,
            }
        });

        let json = self
            .post_json("Ollama LLM", self.client.post(&url), &body)
            .await?;
        json["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ZhijiError::Llm("Ollama LLM response missing message content".into()))
    }

    /// OpenAI-compatible: POST {base_url}/v1/chat/completions
    async fn chat_openai(&self, default_base: &str, messages: &[LlmMessage]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url(default_base));
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": openai_messages(messages),
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.key()));
        let json = self.post_json("OpenAI LLM", request, &body).await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ZhijiError::Llm("OpenAI LLM response missing content".into()))
    }

    /// Anthropic: POST {base_url}/v1/messages
    async fn chat_anthropic(&self, messages: &[LlmMessage]) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url("https://api.anthropic.com"));

        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == LlmRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != LlmRole::System)
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.join("\n\n"));
        }

        let request = self
            .client
            .post(&url)
            .header("x-api-key", self.key())
            .header("anthropic-version", "2023-06-01");
        let json = self.post_json("Anthropic LLM", request, &body).await?;

        // {"content": [{"type": "text", "text": "..."}]}
        json["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ZhijiError::Llm("Anthropic LLM response missing text content".into()))
    }

    /// Gemini: POST /v1beta/models/{model}:generateContent
    async fn chat_gemini(&self, messages: &[LlmMessage]) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url("https://generativelanguage.googleapis.com"),
            self.config.model,
            self.key(),
        );

        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == LlmRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != LlmRole::System)
            .map(|m| {
                let role = if m.role == LlmRole::Assistant {
                    "model"
                } else {
                    "user"
                };
                serde_json::json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.config.max_tokens,
                "temperature": self.config.temperature,
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system.join("\n\n")}]});
        }

        let json = self
            .post_json("Gemini LLM", self.client.post(&url), &body)
            .await?;
        json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ZhijiError::Llm("Gemini LLM response missing text".into()))
    }
}

impl TextGenerator for LlmService {
    fn chat<'a>(&'a self, messages: &'a [LlmMessage]) -> GenerateFuture<'a> {
        Box::pin(async move {
            match self.provider {
                LlmProvider::Ollama => self.chat_ollama(messages).await,
                LlmProvider::OpenAi { default_base } => {
                    self.chat_openai(default_base, messages).await
                }
                LlmProvider::Gemini => self.chat_gemini(messages).await,
                LlmProvider::Anthropic => self.chat_anthropic(messages).await,
            }
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

fn openai_messages(messages: &[LlmMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

// ---------------------------------------------------------------------------
// Offline generator
// ---------------------------------------------------------------------------

/// Deterministic generator that answers from substring rules. Used for
/// offline runs and for driving LLM-dependent code paths in tests.
///
/// A rule matches when its marker occurs in any message of the request; the
/// first matching rule wins, otherwise the default reply is returned.
pub struct ScriptedGenerator {
    rules: Vec<(String, std::result::Result<String, String>)>,
    default_reply: std::result::Result<String, String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_reply: Ok(default_reply.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A generator whose every call fails with an LLM error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            default_reply: Err(message.into()),
            ..Self::new("")
        }
    }

    pub fn with_rule(mut self, marker: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((marker.into(), Ok(reply.into())));
        self
    }

    pub fn with_failing_rule(mut self, marker: impl Into<String>, error: impl Into<String>) -> Self {
        self.rules.push((marker.into(), Err(error.into())));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, messages joined by newlines.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn chat<'a>(&'a self, messages: &'a [LlmMessage]) -> GenerateFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let joined = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let reply = self
            .rules
            .iter()
            .find(|(marker, _)| joined.contains(marker.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone());
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(joined);
        }
        Box::pin(async move { reply.map_err(ZhijiError::Llm) })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowGenerator;

    impl TextGenerator for SlowGenerator {
        fn chat<'a>(&'a self, _messages: &'a [LlmMessage]) -> GenerateFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_from_config_ollama() {
        let config = LlmConfig {
            provider: "ollama".into(),
            model: "qwen2.5".into(),
            ..Default::default()
        };
        let service = LlmService::from_config(&config).unwrap();
        assert_eq!(service.model_name(), "qwen2.5");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let config = LlmConfig {
            provider: "banana".into(),
            ..Default::default()
        };
        let err = LlmService::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown LLM provider"));
    }

    #[test]
    fn test_from_config_deepseek_with_key() {
        let config = LlmConfig {
            provider: "deepseek".into(),
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert!(LlmService::from_config(&config).is_ok());
    }

    #[test]
    fn test_from_config_missing_key_names_env_var() {
        let config = LlmConfig {
            provider: "openai".into(),
            api_key: None,
            env_var: Some("ZHIJI_TEST_NO_SUCH_LLM_KEY".into()),
            ..Default::default()
        };
        let err = LlmService::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("ZHIJI_TEST_NO_SUCH_LLM_KEY"));
    }

    #[test]
    fn test_claude_alias() {
        let config = LlmConfig {
            provider: "claude".into(),
            api_key: Some("sk-ant-test".into()),
            ..Default::default()
        };
        assert!(LlmService::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_scripted_rules_and_default() {
        let llm = ScriptedGenerator::new("default")
            .with_rule("意图", "{\"route_type\":\"direct_chat\"}")
            .with_failing_rule("boom", "upstream 503");

        let reply = llm.generate("请分析意图", None).await.unwrap();
        assert!(reply.contains("direct_chat"));
        assert_eq!(llm.generate("随便聊聊", None).await.unwrap(), "default");

        let err = llm.generate("boom", Some("sys")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(llm.calls(), 3);
        assert!(llm.prompts()[2].starts_with("sys\n"));
    }

    #[tokio::test]
    async fn test_generate_with_timeout_elapses() {
        let err = generate_with_timeout(&SlowGenerator, "hi", None, 0, "chat")
            .await
            .unwrap_err();
        assert!(matches!(err, ZhijiError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_failing_generator() {
        let llm = ScriptedGenerator::failing("down");
        assert!(llm.generate("x", None).await.is_err());
    }
}
