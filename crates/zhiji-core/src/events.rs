//! Extraction of significant events from conversations.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::Result;
use crate::json::extract_json;
use crate::llm::{chat_with_timeout, LlmMessage, TextGenerator};
use crate::model::{local_timestamp, tag_color_for, ChatMessage, Event, Role};
use crate::storage::JsonStore;

const SYSTEM_PROMPT: &str = r##"你是一个专业的事件提取助手。从心理咨询用户对话中提取关键事件，只返回JSON：
{"events": [{"primaryType": "emotional/cognitive/interpersonal/behavioral/physiological/lifeEvent",
  "subType": "emotionalLow/positiveThinking/conflict/avoidance/sleepIssues/transition等",
  "title": "事件标题", "content": "事件详细描述", "dialogContent": "原始对话内容",
  "status": "pending", "tagColor": "#颜色代码"}]}
只提取真实发生的事件，不要推测；每个事件必须包含primaryType和subType。"##;

/// An event as proposed by the model, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposedEvent {
    #[serde(default)]
    primary_type: Option<String>,
    #[serde(default)]
    sub_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    dialog_content: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tag_color: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// `evt_{millis}_{index}_{8 hex}`; unique within and across batches.
fn event_id(index: usize) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("evt_{millis}_{index}_{}", &suffix[..8])
}

/// Turn a model reply into validated events. Items missing any of
/// primaryType, subType, title or content are dropped.
pub fn events_from_reply(reply: &str, dialog_content: &str) -> Vec<Event> {
    let Some(value) = extract_json(reply) else {
        tracing::warn!("event extraction reply had no JSON object");
        return Vec::new();
    };
    let Some(items) = value.get("events").and_then(|v| v.as_array()) else {
        tracing::debug!("event extraction reply had no events field");
        return Vec::new();
    };

    let now = local_timestamp();
    let mut events = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let proposed: ProposedEvent = serde_json::from_value(item.clone()).unwrap_or_default();
        let (Some(primary_type), Some(sub_type), Some(title), Some(content)) = (
            non_empty(proposed.primary_type),
            non_empty(proposed.sub_type),
            non_empty(proposed.title),
            non_empty(proposed.content),
        ) else {
            tracing::warn!(index = i, "dropping extracted event with missing fields");
            continue;
        };
        let tag_color = non_empty(proposed.tag_color)
            .unwrap_or_else(|| tag_color_for(&primary_type).to_string());
        events.push(Event {
            id: event_id(i),
            primary_type,
            sub_type,
            title,
            content,
            dialog_content: non_empty(proposed.dialog_content)
                .unwrap_or_else(|| dialog_content.to_string()),
            source_dialog_id: None,
            status: non_empty(proposed.status).unwrap_or_else(|| "pending".to_string()),
            tag_color,
            time: now.clone(),
            create_time: now.clone(),
            update_time: now.clone(),
        });
    }
    events
}

pub struct EventExtractor {
    llm: Option<Arc<dyn TextGenerator>>,
    timeout_secs: u64,
}

impl EventExtractor {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, timeout_secs: u64) -> Self {
        Self { llm, timeout_secs }
    }

    /// Extract events from a conversation. Empty input, a missing model or
    /// any failure yields an empty list.
    pub async fn extract_events(&self, conversation: &[ChatMessage]) -> Vec<Event> {
        if conversation.is_empty() {
            return Vec::new();
        }
        let Some(llm) = &self.llm else {
            return Vec::new();
        };

        let formatted = conversation
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let dialog_content = conversation
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(format!("请从以下对话中提取事件：\n\n{formatted}")),
        ];
        match chat_with_timeout(llm.as_ref(), &messages, self.timeout_secs, "event extraction").await {
            Ok(reply) => {
                let events = events_from_reply(&reply, &dialog_content);
                tracing::info!(count = events.len(), "extracted events");
                events
            }
            Err(e) => {
                tracing::warn!("event extraction failed: {e}");
                Vec::new()
            }
        }
    }

    /// Extract and append to the session's stored events.
    pub async fn extract_and_store(
        &self,
        store: &JsonStore,
        session_id: &str,
        conversation: &[ChatMessage],
    ) -> Result<Vec<Event>> {
        let events = self.extract_events(conversation).await;
        if !events.is_empty() {
            store.append_events(session_id, &events).await?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;

    const REPLY: &str = r##"```json
{"events": [
  {"primaryType": "emotional", "subType": "emotionalLow", "title": "情绪低落", "content": "最近一周情绪低落"},
  {"primaryType": "physiological", "subType": "sleepIssues", "title": "失眠", "content": "入睡困难", "status": "resolved", "tagColor": "#000000"},
  {"primaryType": "cognitive", "subType": "", "title": "缺子类型", "content": "应被丢弃"},
  {"primaryType": "lifeEvent", "title": "缺字段"}
]}
```"##;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("我这一周心情都很低落"),
            ChatMessage::agent("听起来很辛苦，发生了什么？"),
            ChatMessage::user("晚上也睡不着"),
            ChatMessage::agent("失眠多久了？"),
        ]
    }

    #[test]
    fn test_reply_validation_and_defaults() {
        let events = events_from_reply(REPLY, "原话");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag_color, "#4192FF");
        assert_eq!(events[0].status, "pending");
        assert_eq!(events[0].dialog_content, "原话");
        assert_eq!(events[1].status, "resolved");
        assert_eq!(events[1].tag_color, "#000000");
        assert_ne!(events[0].id, events[1].id);
        assert!(events[0].id.starts_with("evt_"));
    }

    #[test]
    fn test_reply_without_events() {
        assert!(events_from_reply("没有事件", "").is_empty());
        assert!(events_from_reply(r#"{"result": []}"#, "").is_empty());
    }

    #[tokio::test]
    async fn test_extract_from_conversation() {
        let llm = Arc::new(ScriptedGenerator::new(REPLY));
        let extractor = EventExtractor::new(Some(llm.clone()), 5);
        let events = extractor.extract_events(&conversation()).await;
        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(!event.primary_type.is_empty());
            assert!(!event.sub_type.is_empty());
            assert!(!event.title.is_empty());
        }
        assert_eq!(events[0].dialog_content, "我这一周心情都很低落\n晚上也睡不着");
        assert!(llm.prompts()[0].contains("agent: 失眠多久了？"));
    }

    #[tokio::test]
    async fn test_empty_conversation_and_failure() {
        let llm = Arc::new(ScriptedGenerator::new(REPLY));
        let extractor = EventExtractor::new(Some(llm.clone()), 5);
        assert!(extractor.extract_events(&[]).await.is_empty());
        assert_eq!(llm.calls(), 0);

        let failing = EventExtractor::new(Some(Arc::new(ScriptedGenerator::failing("500"))), 5);
        assert!(failing.extract_events(&conversation()).await.is_empty());
    }

    #[tokio::test]
    async fn test_extract_and_store() {
        let dir = std::env::temp_dir().join(format!("zhiji-evt-{}", uuid::Uuid::now_v7()));
        let store = JsonStore::new(dir, 5);
        let extractor = EventExtractor::new(Some(Arc::new(ScriptedGenerator::new(REPLY))), 5);
        extractor.extract_and_store(&store, "s1", &conversation()).await.unwrap();
        extractor.extract_and_store(&store, "s1", &conversation()).await.unwrap();
        assert_eq!(store.get_events("s1").await.unwrap().len(), 4);
    }
}
