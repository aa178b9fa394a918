//! Lenient JSON extraction from LLM output.

use serde::de::DeserializeOwned;

/// Strip a surrounding Markdown code fence (```json ... ``` or ``` ... ```).
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the JSON object embedded in `text`.
///
/// Tries the fence-stripped text as a whole, then the span between the first
/// `{` and the last `}`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let body = strip_code_fence(text);
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&body[start..=end]) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// [`extract_json`] followed by typed deserialization.
pub fn extract_as<T: DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_value(extract_json(text)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_json() {
        let text = "```json\n{\"route_type\": \"rag_enhanced\"}\n```";
        assert_eq!(extract_json(text).unwrap()["route_type"], "rag_enhanced");
    }

    #[test]
    fn test_json_surrounded_by_prose() {
        let text = "好的，分析如下：{\"a\": {\"b\": 1}} 希望有帮助";
        assert_eq!(extract_json(text).unwrap()["a"]["b"], 1);
    }

    #[test]
    fn test_no_json() {
        assert!(extract_json("信息完整度：60%").is_none());
        assert!(extract_json("} backwards {").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_extract_as_typed() {
        #[derive(serde::Deserialize)]
        struct Verdict {
            ok: bool,
        }
        let v: Verdict = extract_as("```\n{\"ok\": true}\n```").unwrap();
        assert!(v.ok);
    }

    #[test]
    fn test_strip_fence_passthrough() {
        assert_eq!(strip_code_fence("  plain  "), "plain");
    }
}
