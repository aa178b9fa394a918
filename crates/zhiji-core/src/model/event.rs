use serde::{Deserialize, Serialize};

/// Event categories recognised by extraction and reporting.
pub const EVENT_TYPES: &[&str] = &[
    "emotional",
    "cognitive",
    "interpersonal",
    "behavioral",
    "physiological",
    "lifeEvent",
];

/// Tag color shown for a primary type; unknown types get grey.
pub fn tag_color_for(primary_type: &str) -> &'static str {
    match primary_type {
        "emotional" => "#4192FF",
        "cognitive" => "#9C27B0",
        "interpersonal" => "#4CAF50",
        "behavioral" => "#FF9800",
        "physiological" => "#F44336",
        "lifeEvent" => "#FFC107",
        _ => "#848484",
    }
}

/// Display name used in reports.
pub fn event_type_label(primary_type: &str) -> &str {
    match primary_type {
        "emotional" => "情绪管理",
        "behavioral" => "行为模式",
        "cognitive" => "认知思考",
        "interpersonal" => "人际关系",
        "physiological" => "身心健康",
        "lifeEvent" => "生活事件",
        other => other,
    }
}

fn pending() -> String {
    "pending".to_string()
}

/// A significant life or psychological event extracted from dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub primary_type: String,
    pub sub_type: String,
    pub title: String,
    pub content: String,
    /// User-side dialogue the event was extracted from.
    #[serde(default)]
    pub dialog_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dialog_id: Option<String>,
    #[serde(default = "pending")]
    pub status: String,
    #[serde(default)]
    pub tag_color: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
}

/// Partial update accepted by `PUT /api/events/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUpdate {
    pub primary_type: Option<String>,
    pub sub_type: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub dialog_content: Option<String>,
    pub status: Option<String>,
    pub tag_color: Option<String>,
    pub time: Option<String>,
}

impl EventUpdate {
    /// Apply the provided fields and bump `updateTime`.
    pub fn apply(self, event: &mut Event) {
        if let Some(v) = self.primary_type {
            if self.tag_color.is_none() {
                event.tag_color = tag_color_for(&v).to_string();
            }
            event.primary_type = v;
        }
        if let Some(v) = self.sub_type {
            event.sub_type = v;
        }
        if let Some(v) = self.title {
            event.title = v;
        }
        if let Some(v) = self.content {
            event.content = v;
        }
        if let Some(v) = self.dialog_content {
            event.dialog_content = v;
        }
        if let Some(v) = self.status {
            event.status = v;
        }
        if let Some(v) = self.tag_color {
            event.tag_color = v;
        }
        if let Some(v) = self.time {
            event.time = v;
        }
        event.update_time = super::local_timestamp();
    }
}
