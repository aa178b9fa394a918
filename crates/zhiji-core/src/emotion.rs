//! Emotion labels for replies and sentiment scores for user messages.

use std::sync::LazyLock;

use regex::Regex;

static EMOTION_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*#(happy|sad|angry|sleepy|neutral)\b").unwrap());

/// Checked in order; the first label with a matching keyword wins.
const EMOTION_KEYWORDS: &[(&str, &[&str])] = &[
    ("happy", &["开心", "高兴", "快乐", "很好", "很棒", "兴奋", "满意"]),
    ("sad", &["悲伤", "难过", "伤心", "痛苦", "抑郁", "失落"]),
    ("angry", &["生气", "愤怒", "恼火", "烦躁", "烦恼", "不满"]),
    ("sleepy", &["累了", "疲惫", "困", "睡觉", "休息", "疲劳"]),
];

const POSITIVE_WORDS: &[&str] = &[
    "开心", "高兴", "快乐", "满意", "喜欢", "轻松", "希望", "感谢", "谢谢", "幸福", "放松",
    "好多了", "不错", "很好", "很棒", "安心", "期待", "平静",
];

const NEGATIVE_WORDS: &[&str] = &[
    "难过", "伤心", "痛苦", "抑郁", "焦虑", "害怕", "担心", "失落", "孤独", "绝望", "崩溃",
    "烦躁", "生气", "愤怒", "压力", "失眠", "累", "疲惫", "想死", "受不了", "自卑", "委屈",
];

const NEGATORS: &[char] = &['不', '没', '别'];

/// Split an explicit `#emotion` tag off a reply, or infer the label from
/// keywords. Returns the cleaned text and the label.
pub fn extract_emotion(content: &str) -> (String, String) {
    if let Some(caps) = EMOTION_TAG_RE.captures(content) {
        let emotion = caps[1].to_lowercase();
        let clean = EMOTION_TAG_RE.replace_all(content, "").trim().to_string();
        return (clean, emotion);
    }

    let lower = content.to_lowercase();
    let emotion = EMOTION_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(label, _)| *label)
        .unwrap_or("neutral");
    (content.to_string(), emotion.to_string())
}

/// Lexicon sentiment in [-1, 1]. A negator directly before a word flips it.
/// Text without any lexicon hit scores 0.
pub fn sentiment_score(text: &str) -> f64 {
    let positive = weighted_hits(text, POSITIVE_WORDS);
    let negative = weighted_hits(text, NEGATIVE_WORDS);
    let pos = positive.0 + negative.1;
    let neg = negative.0 + positive.1;
    if pos + neg == 0.0 {
        return 0.0;
    }
    ((pos - neg) / (pos + neg + 1.0)).clamp(-1.0, 1.0)
}

/// (plain hits, negated hits)
fn weighted_hits(text: &str, words: &[&str]) -> (f64, f64) {
    let mut plain = 0.0;
    let mut negated = 0.0;
    for word in words {
        for (idx, _) in text.match_indices(word) {
            let preceded_by_negator = text[..idx]
                .chars()
                .next_back()
                .is_some_and(|c| NEGATORS.contains(&c));
            if preceded_by_negator {
                negated += 1.0;
            } else {
                plain += 1.0;
            }
        }
    }
    (plain, negated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_tag_is_stripped() {
        let (clean, emotion) = extract_emotion("我明白你的感受。 #SAD");
        assert_eq!(clean, "我明白你的感受。");
        assert_eq!(emotion, "sad");
    }

    #[test]
    fn test_keyword_inference_order() {
        assert_eq!(extract_emotion("今天很开心").1, "happy");
        assert_eq!(extract_emotion("有点烦躁").1, "angry");
        assert_eq!(extract_emotion("我累了").1, "sleepy");
        assert_eq!(extract_emotion("我们聊聊工作").1, "neutral");
    }

    #[test]
    fn test_sentiment_signs() {
        assert!(sentiment_score("今天很开心，也很轻松") > 0.0);
        assert!(sentiment_score("我很焦虑，压力好大") < 0.0);
        assert_eq!(sentiment_score("我们聊聊工作"), 0.0);
    }

    #[test]
    fn test_negation_flips() {
        assert!(sentiment_score("我不开心") < 0.0);
    }

    #[test]
    fn test_sentiment_bounded() {
        let s = sentiment_score(&"痛苦".repeat(50));
        assert!((-1.0..=1.0).contains(&s));
    }
}
