//! The confidant report (知己报告): statistics over a user's recent data,
//! an LLM-written analysis, and plain-text rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, ZhijiError};
use crate::json::extract_json;
use crate::llm::{generate_with_timeout, TextGenerator};
use crate::model::{event_type_label, EmotionRecord, Event, MemoryEntry, UserProfile};
use crate::pattern::PatternAnalysis;
use crate::storage::JsonStore;

const EMOTION_SAMPLE: usize = 50;
const MEMORY_SAMPLE: usize = 20;

const ANALYSIS_PROMPT: &str = r#"你是一位专业的心理健康数据分析师。基于用户的行为模式、事件历史和情绪数据，生成专业的心理健康分析报告。
只返回JSON：
{"summary": {"overallStatus": "", "keyFindings": [], "riskLevel": "low/medium/high", "progressTrend": "improving/stable/declining"},
 "behaviorPatterns": {"dominantPatterns": [], "triggers": [], "copingStrategies": [], "patternEvolution": ""},
 "eventAnalysis": {"frequentEventTypes": [], "impactfulEvents": [], "emotionalTriggers": [], "recoveryPatterns": ""},
 "emotionalProfile": {"dominantEmotions": [], "emotionalRange": "", "stableEmotions": [], "volatileEmotions": []},
 "recommendations": {"immediate": [], "shortTerm": [], "longTerm": [], "professionalReferral": ""},
 "riskAssessment": {"currentRisks": [], "protectiveFactors": [], "warningSignals": [], "interventionPriority": "high/medium/low"}}
请确保分析客观、专业，提供具体可行的建议。"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPeriod {
    pub days: u32,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total_events: usize,
    pub event_types: BTreeMap<String, usize>,
    pub event_subtypes: BTreeMap<String, usize>,
    pub event_status: BTreeMap<String, usize>,
    pub most_common_types: Vec<(String, usize)>,
    pub most_common_subtypes: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub total_patterns: usize,
    pub common_triggers: Vec<(String, usize)>,
    pub common_coping_strategies: Vec<(String, usize)>,
}

/// Sentiment scores are in [-1, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmotionStatistics {
    pub total_records: usize,
    pub emotion_distribution: BTreeMap<String, usize>,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub median_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngagementStatistics {
    pub total_sessions: usize,
    pub total_messages: usize,
    pub total_events: usize,
    pub total_emotions: usize,
    pub memory_entries: usize,
    /// 0-10.
    pub engagement_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub event_statistics: EventStatistics,
    pub pattern_statistics: PatternStatistics,
    pub emotion_statistics: EmotionStatistics,
    pub engagement_statistics: EngagementStatistics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub sessions_analyzed: usize,
    pub total_events: usize,
    pub total_patterns: usize,
    pub emotion_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReport {
    pub user_id: String,
    pub generated_at: String,
    pub analysis_period: AnalysisPeriod,
    pub data_summary: ReportStatistics,
    /// LLM analysis, or a statistics-only fallback carrying an `error` key.
    pub ai_analysis: serde_json::Value,
    pub metadata: ReportMetadata,
}

impl UserReport {
    /// True when the LLM analysis could not be produced.
    pub fn is_degraded(&self) -> bool {
        self.ai_analysis.get("error").is_some()
    }
}

/// Everything gathered for one user within the analysis window.
#[derive(Debug, Default)]
struct UserData {
    sessions: Vec<String>,
    total_messages: usize,
    events: Vec<Event>,
    patterns: Vec<PatternAnalysis>,
    emotions: Vec<EmotionRecord>,
    profile: UserProfile,
    memories: Vec<MemoryEntry>,
}

/// Parse the two timestamp forms used in stored data.
fn parse_time(s: &str) -> Option<DateTime<Local>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

/// Items without a parseable timestamp are kept.
fn within_window(timestamp: &str, cutoff: DateTime<Local>) -> bool {
    parse_time(timestamp).map_or(true, |t| t >= cutoff)
}

fn count<'a>(items: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Most frequent entries, ties broken by name.
fn most_common(counts: &BTreeMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn event_statistics(events: &[Event]) -> EventStatistics {
    let event_types = count(events.iter().map(|e| e.primary_type.as_str()));
    let event_subtypes = count(events.iter().map(|e| e.sub_type.as_str()));
    EventStatistics {
        total_events: events.len(),
        most_common_types: most_common(&event_types, 3),
        most_common_subtypes: most_common(&event_subtypes, 5),
        event_status: count(events.iter().map(|e| e.status.as_str())),
        event_types,
        event_subtypes,
    }
}

fn pattern_statistics(patterns: &[PatternAnalysis]) -> PatternStatistics {
    let mut triggers = Vec::new();
    let mut coping = Vec::new();
    for p in patterns {
        triggers.extend(string_list(&p.pattern_analysis.trigger_patterns, "common_triggers"));
        coping.extend(string_list(&p.pattern_analysis.behavioral_patterns, "coping_strategies"));
    }
    PatternStatistics {
        total_patterns: patterns.len(),
        common_triggers: most_common(&count(triggers.iter().map(String::as_str)), 5),
        common_coping_strategies: most_common(&count(coping.iter().map(String::as_str)), 5),
    }
}

fn emotion_statistics(emotions: &[EmotionRecord]) -> EmotionStatistics {
    if emotions.is_empty() {
        return EmotionStatistics::default();
    }
    let mut scores: Vec<f64> = emotions.iter().map(|e| e.score).collect();
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    EmotionStatistics {
        total_records: emotions.len(),
        emotion_distribution: count(emotions.iter().map(|e| e.emotion.as_str())),
        average_score: scores.iter().sum::<f64>() / scores.len() as f64,
        min_score: scores[0],
        max_score: scores[scores.len() - 1],
        median_score: median(&scores),
    }
}

/// Weighted saturation of each data source, scaled to 0-10.
fn engagement_score(data: &UserData) -> f64 {
    let saturate = |n: usize, full: f64| (n as f64 / full).min(1.0);
    let has_profile = data.profile != UserProfile::default();
    let score = saturate(data.events.len(), 10.0) * 0.3
        + saturate(data.patterns.len(), 5.0) * 0.25
        + saturate(data.emotions.len(), 20.0) * 0.2
        + saturate(data.memories.len(), 10.0) * 0.15
        + if has_profile { 0.1 } else { 0.0 };
    (score * 1000.0).round() / 100.0
}

fn statistics(data: &UserData) -> ReportStatistics {
    ReportStatistics {
        event_statistics: event_statistics(&data.events),
        pattern_statistics: pattern_statistics(&data.patterns),
        emotion_statistics: emotion_statistics(&data.emotions),
        engagement_statistics: EngagementStatistics {
            total_sessions: data.sessions.len(),
            total_messages: data.total_messages,
            total_events: data.events.len(),
            total_emotions: data.emotions.len(),
            memory_entries: data.memories.len(),
            engagement_score: engagement_score(data),
        },
    }
}

fn fallback_analysis(stats: &ReportStatistics, error: &str) -> serde_json::Value {
    json!({
        "error": error,
        "summary": {
            "overallStatus": "需要进一步分析",
            "keyFindings": [
                format!("共记录了{}个事件", stats.event_statistics.total_events),
                format!("情绪记录平均分为{:.2}", stats.emotion_statistics.average_score),
                format!("参与度评分为{}", stats.engagement_statistics.engagement_score),
            ],
            "riskLevel": "unknown",
            "progressTrend": "需要更多数据",
        },
        "recommendations": {
            "immediate": ["继续记录情绪和事件", "保持定期交流"],
            "shortTerm": ["建立规律的自我反思习惯"],
            "longTerm": ["持续关注心理健康状况"],
        },
    })
}

/// Sentiment in [-1, 1] shown on the 0-10 scale used in reports.
fn ten_point(score: f64) -> f64 {
    (score.clamp(-1.0, 1.0) + 1.0) * 5.0
}

/// Full text rendering of a report.
pub fn render_report(report: &UserReport) -> String {
    let mut out = String::new();
    let rule = "=".repeat(50);
    out.push_str(&format!("📊 知己报告 - 全面心理健康分析报告\n{rule}\n\n"));

    out.push_str("🔍 报告基本信息\n");
    out.push_str(&format!("• 用户ID: {}\n", report.user_id));
    out.push_str(&format!("• 生成时间: {}\n", report.generated_at));
    out.push_str(&format!("• 分析时间范围: 最近{}天\n", report.analysis_period.days));
    out.push_str(&format!("• 分析会话数: {}\n", report.metadata.sessions_analyzed));
    out.push_str(&format!("• 事件总数: {}\n", report.metadata.total_events));
    out.push_str(&format!("• 情绪记录数: {}\n\n", report.metadata.emotion_records));

    let ai = &report.ai_analysis;
    if let Some(summary) = ai.get("summary") {
        let field = |key: &str, default: &str| {
            summary
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        out.push_str("🎯 执行摘要\n");
        out.push_str(&format!("• 整体状态: {}\n", field("overallStatus", "需要更多数据")));
        out.push_str(&format!("• 风险等级: {}\n", field("riskLevel", "未评估")));
        out.push_str(&format!("• 进步趋势: {}\n\n", field("progressTrend", "待观察")));
        let findings = string_list(summary, "keyFindings");
        if !findings.is_empty() {
            out.push_str("🔍 关键发现\n");
            for (i, finding) in findings.iter().take(5).enumerate() {
                out.push_str(&format!("{}. {finding}\n", i + 1));
            }
            out.push('\n');
        }
    }

    if let Some(recs) = ai.get("recommendations") {
        out.push_str("💡 专业建议\n");
        for (key, title) in [("immediate", "立即建议"), ("shortTerm", "短期建议"), ("longTerm", "长期建议")] {
            let items = string_list(recs, key);
            if !items.is_empty() {
                out.push_str(&format!("{title}:\n"));
                for item in items.iter().take(3) {
                    out.push_str(&format!("• {item}\n"));
                }
                out.push('\n');
            }
        }
    }

    let event_stats = &report.data_summary.event_statistics;
    if !event_stats.most_common_types.is_empty() {
        out.push_str("📈 数据分析概览\n主要事件类型:\n");
        for (kind, n) in &event_stats.most_common_types {
            out.push_str(&format!("• {}: {n}次\n", event_type_label(kind)));
        }
        out.push('\n');
    }

    out.push_str("📝 说明\n");
    out.push_str(&format!(
        "本报告基于您最近{}天的对话数据生成，旨在帮助您更好地了解自己的心理状态和行为模式。\n",
        report.analysis_period.days
    ));
    out.push_str("如需更详细的分析或专业建议，建议继续保持定期交流。");
    out
}

/// Raw counts behind the basic report.
#[derive(Debug, Clone, Default)]
pub struct BasicStats {
    pub session_count: usize,
    pub total_messages: usize,
    pub recent_events: Vec<Event>,
    pub emotions: Vec<EmotionRecord>,
}

/// Statistics-only report used when the full report cannot be produced.
pub fn basic_report(user_id: &str, stats: &BasicStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("📊 知己报告 - 基础心理健康分析\n{}\n\n", "=".repeat(50)));

    out.push_str("🔍 报告基本信息\n");
    out.push_str(&format!("• 用户ID: {user_id}\n"));
    out.push_str(&format!("• 生成时间: {}\n", crate::model::local_timestamp()));
    out.push_str(&format!("• 会话数量: {}个\n", stats.session_count));
    out.push_str(&format!("• 消息总数: {}条\n", stats.total_messages));
    out.push_str(&format!("• 记录事件: {}个\n", stats.recent_events.len()));
    out.push_str(&format!("• 情绪记录: {}条\n\n", stats.emotions.len()));

    out.push_str("📝 数据状态评估\n");
    out.push_str(match stats.total_messages {
        0..=9 => "• 当前处于咨询初期阶段，数据积累较少\n• 建议继续保持交流，以便获得更准确的分析\n\n",
        10..=29 => "• 已建立了初步的对话基础\n• 数据正在积累中，分析准确性将逐步提升\n\n",
        _ => "• 已积累了丰富的对话数据\n• 具备了进行深度分析的基础条件\n\n",
    });

    if !stats.recent_events.is_empty() {
        let start = stats.recent_events.len().saturating_sub(5);
        let counts = count(stats.recent_events[start..].iter().map(|e| e.primary_type.as_str()));
        out.push_str("🎯 近期事件概览\n主要关注领域:\n");
        for (kind, n) in most_common(&counts, counts.len()) {
            out.push_str(&format!("• {}: {n}次记录\n", event_type_label(&kind)));
        }
        out.push('\n');
    }

    if !stats.emotions.is_empty() {
        let recent = &stats.emotions[stats.emotions.len().saturating_sub(5)..];
        let avg = recent.iter().map(|e| ten_point(e.score)).sum::<f64>() / recent.len() as f64;
        let desc = if avg >= 7.0 {
            "整体情绪状态较为积极"
        } else if avg >= 5.0 {
            "情绪状态相对平稳"
        } else {
            "可能需要关注情绪调节"
        };
        out.push_str("😊 情绪状态简析\n");
        out.push_str(&format!("• 近期情绪评分: {avg:.1}/10\n• 状态评估: {desc}\n\n"));
    }

    out.push_str("💡 当前建议\n");
    if stats.total_messages < 10 {
        out.push_str("• 继续保持开放的交流态度，分享更多具体的感受和想法\n");
        out.push_str("• 可以尝试描述具体的生活场景和情绪体验\n");
    } else {
        out.push_str("• 定期进行自我反思，关注情绪和行为模式的变化\n");
        out.push_str("• 继续记录重要的生活事件和情绪状态\n");
    }
    out.push_str("• 建立良好的作息习惯，保持身心健康\n");
    out.push_str("• 如有需要，寻求专业心理咨询师的支持\n\n");
    out.push_str("📋 报告说明\n本报告基于当前可用的对话和行为数据生成，是一份基础版分析报告。\n");
    out.push_str("随着交流的深入和数据的积累，系统将能够提供更详细和个性化的分析报告。");
    out
}

pub struct ReportService {
    llm: Option<Arc<dyn TextGenerator>>,
    store: Arc<JsonStore>,
    timeout_secs: u64,
}

impl ReportService {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, store: Arc<JsonStore>, timeout_secs: u64) -> Self {
        Self {
            llm,
            store,
            timeout_secs,
        }
    }

    async fn collect(&self, user_id: &str, cutoff: DateTime<Local>) -> Result<UserData> {
        let sessions = self.store.user_sessions(user_id).await?;
        let mut data = UserData::default();
        for sid in &sessions {
            data.total_messages += self.store.message_count(sid).await?;
            data.events.extend(
                self.store
                    .get_events(sid)
                    .await?
                    .into_iter()
                    .filter(|e| within_window(&e.time, cutoff)),
            );
            if let Some(pattern) = self.store.get_pattern::<PatternAnalysis>(sid).await? {
                data.patterns.push(pattern);
            }
        }
        data.emotions = self
            .store
            .get_emotions(user_id, Some(EMOTION_SAMPLE))
            .await?
            .into_iter()
            .filter(|e| within_window(&e.timestamp, cutoff))
            .collect();
        data.profile = self.store.get_profile(user_id).await?;
        data.memories = self.store.get_memories(user_id, Some(MEMORY_SAMPLE)).await?;
        data.sessions = sessions;
        Ok(data)
    }

    async fn ai_analysis(&self, stats: &ReportStatistics) -> serde_json::Value {
        let Some(llm) = &self.llm else {
            return fallback_analysis(stats, "未配置语言模型");
        };
        let input = json!({
            "user_data_summary": {
                "total_events": stats.event_statistics.total_events,
                "total_patterns": stats.pattern_statistics.total_patterns,
                "total_emotions": stats.emotion_statistics.total_records,
                "engagement_score": stats.engagement_statistics.engagement_score,
            },
            "statistics": stats,
        });
        let prompt = format!(
            "用户数据分析：\n{}\n\n请基于以上数据生成专业的心理健康分析报告。",
            serde_json::to_string_pretty(&input).unwrap_or_default()
        );
        match generate_with_timeout(llm.as_ref(), &prompt, Some(ANALYSIS_PROMPT), self.timeout_secs, "analysis report").await {
            Ok(reply) => extract_json(&reply).unwrap_or_else(|| {
                tracing::warn!("analysis reply was not JSON");
                fallback_analysis(stats, "AI分析结果解析失败")
            }),
            Err(e) => {
                tracing::warn!("analysis generation failed: {e}");
                fallback_analysis(stats, "AI分析生成失败")
            }
        }
    }

    /// Build the report for the last `days` days. Errors on storage failures
    /// and on a window reaching past the representable calendar; an LLM
    /// failure produces a degraded report.
    pub async fn generate_user_report(&self, user_id: &str, days: u32) -> Result<UserReport> {
        if user_id.trim().is_empty() {
            return Err(ZhijiError::InvalidInput("user_id is required".into()));
        }
        let now = Local::now();
        let start = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| ZhijiError::InvalidInput(format!("days out of range: {days}")))?;
        let data = self.collect(user_id, start).await?;
        let stats = statistics(&data);
        let ai_analysis = self.ai_analysis(&stats).await;

        Ok(UserReport {
            user_id: user_id.to_string(),
            generated_at: now.to_rfc3339(),
            analysis_period: AnalysisPeriod {
                days,
                start_date: start.to_rfc3339(),
                end_date: now.to_rfc3339(),
            },
            metadata: ReportMetadata {
                sessions_analyzed: data.sessions.len(),
                total_events: data.events.len(),
                total_patterns: data.patterns.len(),
                emotion_records: data.emotions.len(),
            },
            data_summary: stats,
            ai_analysis,
        })
    }

    /// Counts for [`basic_report`]. Read failures count as no data.
    pub async fn basic_stats(&self, user_id: &str) -> BasicStats {
        let sessions = self.store.user_sessions(user_id).await.unwrap_or_default();
        let mut stats = BasicStats {
            session_count: sessions.len(),
            ..Default::default()
        };
        for sid in &sessions {
            stats.total_messages += self.store.message_count(sid).await.unwrap_or(0);
        }
        // Sessions are ordered newest first.
        for sid in sessions.iter().take(3) {
            let events = self.store.get_events(sid).await.unwrap_or_default();
            let start = events.len().saturating_sub(2);
            stats.recent_events.extend(events.into_iter().skip(start));
        }
        stats.emotions = self
            .store
            .get_emotions(user_id, Some(10))
            .await
            .unwrap_or_default();
        stats
    }

    /// Rendered report text for a chat turn; the basic report when the full
    /// one fails or is degraded.
    pub async fn report_text(&self, user_id: &str, days: u32) -> (String, Option<UserReport>) {
        match self.generate_user_report(user_id, days).await {
            Ok(report) if !report.is_degraded() => (render_report(&report), Some(report)),
            Ok(_) => {
                tracing::warn!(user_id, "analysis was degraded, using basic report");
                (basic_report(user_id, &self.basic_stats(user_id).await), None)
            }
            Err(e) => {
                tracing::warn!(user_id, "report generation failed: {e}");
                (basic_report(user_id, &self.basic_stats(user_id).await), None)
            }
        }
    }
}
