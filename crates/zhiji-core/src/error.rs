use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZhijiError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Graph error: {0}")]
    Graph(String),
}

impl ZhijiError {
    /// Returns `true` when the error is likely transient and worth retrying
    /// (HTTP 429/5xx, network timeouts, refused or reset connections).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Llm(msg) | Self::Embedding(msg) | Self::Search(msg) | Self::Storage(msg) => {
                is_transient_message(msg)
            }
            _ => false,
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    if ["429", "500", "502", "503", "504"]
        .iter()
        .any(|code| lower.contains(code))
    {
        return true;
    }
    [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

pub type Result<T> = std::result::Result<T, ZhijiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_llm_is_transient() {
        let err = ZhijiError::Llm("OpenAI LLM error 429 Too Many Requests".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_gateway_error_on_search_is_transient() {
        let err = ZhijiError::Search("serpapi returned 502".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_timeout_variant_is_transient() {
        assert!(ZhijiError::Timeout("chat after 60s".into()).is_transient());
    }

    #[test]
    fn test_reset_connection_is_transient() {
        let err = ZhijiError::Embedding("connection reset by peer".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_unauthorized_is_permanent() {
        let err = ZhijiError::Llm("OpenAI LLM error 401 Unauthorized".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_validation_errors_are_permanent() {
        assert!(!ZhijiError::InvalidInput("empty message".into()).is_transient());
        assert!(!ZhijiError::NotFound("session s1".into()).is_transient());
        assert!(!ZhijiError::Config("missing key".into()).is_transient());
    }
}
