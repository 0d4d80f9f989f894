use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ClassifierMode;
use crate::error::PilotError;
use crate::model::{ModelClient, RawParsed};

/// Typed task record. Field presence is a property of the variant: a moments
/// post has no recipient, a complex task carries only its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTask {
    SendMessage { recipient: String, content: String },
    PostMoment { content: String },
    Others { text: String },
    Invalid,
}

/// Coarse task class derived from the parsed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Simple,
    Complex,
    Invalid,
}

impl ParsedTask {
    /// Wire name matching the classifier model contract.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParsedTask::SendMessage { .. } => "send_msg",
            ParsedTask::PostMoment { .. } => "post_moment_only_text",
            ParsedTask::Others { .. } => "others",
            ParsedTask::Invalid => "invalid",
        }
    }

    pub fn task_class(&self) -> TaskClass {
        match self {
            ParsedTask::SendMessage { .. } | ParsedTask::PostMoment { .. } => TaskClass::Simple,
            ParsedTask::Others { .. } => TaskClass::Complex,
            ParsedTask::Invalid => TaskClass::Invalid,
        }
    }

    /// Convert the raw model record. Missing required fields demote the
    /// record rather than inventing content.
    pub fn from_raw(raw: RawParsed) -> Self {
        match raw.task_type.as_str() {
            "send_msg" => {
                if raw.recipient.trim().is_empty() || raw.content.trim().is_empty() {
                    ParsedTask::Invalid
                } else {
                    ParsedTask::SendMessage {
                        recipient: raw.recipient.trim().to_string(),
                        content: raw.content.trim().to_string(),
                    }
                }
            }
            "post_moment_only_text" => {
                if raw.content.trim().is_empty() {
                    ParsedTask::Invalid
                } else {
                    ParsedTask::PostMoment {
                        content: raw.content.trim().to_string(),
                    }
                }
            }
            "others" => ParsedTask::Others {
                text: raw.content.trim().to_string(),
            },
            "invalid" => ParsedTask::Invalid,
            other => {
                debug!("classifier returned unknown type '{}'", other);
                ParsedTask::Invalid
            }
        }
    }

}

// ── Fixed-form (`ss:`) grammar ──────────────────────────────────────────────

const SEND_SYNONYMS: &[&str] = &["消息", "发消息", "xx", "msg", "message"];
const MOMENT_SYNONYMS: &[&str] = &["朋友圈", "pyq"];

/// Trim and fold the full-width colon so both widths parse identically.
pub fn normalize(utterance: &str) -> String {
    utterance.trim().replace('：', ":")
}

/// Whether the utterance carries the fixed-form prefix (any case, either
/// colon width). A bare `ss` with no colon is natural language.
pub fn has_fast_prefix(utterance: &str) -> bool {
    let n = normalize(utterance);
    matches!(n.get(..2), Some(p) if p.eq_ignore_ascii_case("ss")) && n[2..].starts_with(':')
}

/// Fast-path parser for the fixed grammar. Returns `None` on any malformed
/// input so the caller falls through to model classification.
pub fn parse_fast(utterance: &str) -> Option<ParsedTask> {
    let normalized = normalize(utterance);
    if !has_fast_prefix(&normalized) {
        return None;
    }
    let parts: Vec<&str> = normalized.split(':').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }

    let selector = parts[1];
    let lower = selector.to_lowercase();
    if SEND_SYNONYMS.contains(&lower.as_str()) {
        // Explicit type token: ss:msg:<recipient>:<content...>
        if parts.len() < 4 || parts[2].is_empty() {
            return None;
        }
        let content = parts[3..].join(":");
        if content.is_empty() {
            return None;
        }
        Some(ParsedTask::SendMessage {
            recipient: parts[2].to_string(),
            content,
        })
    } else if MOMENT_SYNONYMS.contains(&lower.as_str()) {
        // ss:朋友圈:<content...>; excess colons belong to the content.
        let content = parts[2..].join(":");
        if content.is_empty() {
            return None;
        }
        Some(ParsedTask::PostMoment { content })
    } else {
        // Shorthand: ss:<recipient>:<content...> defaults to send_msg.
        if selector.is_empty() {
            return None;
        }
        let content = parts[2..].join(":");
        if content.is_empty() {
            return None;
        }
        Some(ParsedTask::SendMessage {
            recipient: selector.to_string(),
            content,
        })
    }
}

/// Canonical spelling of a well-formed fixed-form utterance: whitespace
/// stripped, colons normalized, fields kept exactly as the user wrote them.
/// No synonym rewriting: the type token (or its absence, in the shorthand
/// form) is preserved, so canonicalization never changes what `parse_fast`
/// sees. Malformed input has no canonical form.
pub fn canonicalize_fast(utterance: &str) -> Option<String> {
    parse_fast(utterance)?;
    let normalized = normalize(utterance);
    let parts: Vec<&str> = normalized.split(':').map(str::trim).collect();
    Some(parts.join(":"))
}

/// Strip the `ss:` prefix for reclassification of malformed fixed-form input.
pub fn strip_fast_prefix(utterance: &str) -> String {
    let normalized = normalize(utterance);
    if has_fast_prefix(&normalized) {
        normalized[3..].trim().to_string()
    } else {
        normalized
    }
}

// ── Classifier ──────────────────────────────────────────────────────────────

/// Outcome of lenient classification: a parsed record when the model
/// produced one, otherwise just the coarse class from the regex heuristic.
#[derive(Debug, Clone)]
pub struct Classification {
    pub parsed: Option<ParsedTask>,
    pub class: TaskClass,
}

/// Utterance classifier: fast grammar callers live above; this wraps the
/// model path with its regex degradation.
pub struct Classifier {
    mode: ClassifierMode,
    model: Arc<ModelClient>,
}

const CONNECTIVES: &[&str] = &["然后", "接着", "之后", "并且", "再", "and then", "after that"];
const ACTION_WORDS: &[&str] = &[
    "发", "打开", "搜索", "回复", "转发", "点赞", "评论", "send", "open", "search", "reply",
    "post", "forward",
];

impl Classifier {
    pub fn new(mode: ClassifierMode, model: Arc<ModelClient>) -> Self {
        Self { mode, model }
    }

    /// Blank, or one/two characters of pure whitespace/punctuation: not a
    /// task at all.
    pub fn is_trivially_invalid(utterance: &str) -> bool {
        let trimmed = utterance.trim();
        if trimmed.is_empty() {
            return true;
        }
        let chars: Vec<char> = trimmed.chars().collect();
        chars.len() <= 2 && chars.iter().all(|c| !c.is_alphanumeric())
    }

    /// Strict classification for the runner's type-routing path. A model
    /// failure here is `ClassificationFailed`: the caller re-prompts instead
    /// of guessing a route.
    pub async fn classify_strict(&self, utterance: &str) -> Result<ParsedTask, PilotError> {
        if Self::is_trivially_invalid(utterance) {
            return Ok(ParsedTask::Invalid);
        }
        if self.mode == ClassifierMode::Regex {
            return Err(PilotError::ClassificationFailed(
                "model classification disabled (TASK_CLASSIFIER_MODE=regex)".into(),
            ));
        }
        match self.model.classify(utterance).await {
            Ok(raw) => Ok(ParsedTask::from_raw(raw)),
            Err(e) => Err(PilotError::ClassificationFailed(e.to_string())),
        }
    }

    /// Lenient classification for handler-local use: model when available,
    /// regex heuristic when the model path is disabled or errors out.
    pub async fn classify_lenient(&self, utterance: &str) -> Classification {
        if Self::is_trivially_invalid(utterance) {
            return Classification {
                parsed: Some(ParsedTask::Invalid),
                class: TaskClass::Invalid,
            };
        }
        if self.mode == ClassifierMode::Llm {
            match self.model.classify(utterance).await {
                Ok(raw) => {
                    let parsed = ParsedTask::from_raw(raw);
                    let class = parsed.task_class();
                    return Classification {
                        parsed: Some(parsed),
                        class,
                    };
                }
                Err(e) => {
                    warn!("model classifier failed ({e}), degrading to regex heuristic");
                }
            }
        }
        Classification {
            parsed: None,
            class: Self::heuristic_class(utterance),
        }
    }

    /// Regex degradation: connective words or two action words flag a
    /// complex task; everything else counts as simple.
    pub fn heuristic_class(utterance: &str) -> TaskClass {
        let has_connective = CONNECTIVES.iter().any(|w| utterance.contains(w));
        let action_count = ACTION_WORDS
            .iter()
            .filter(|w| utterance.contains(*w))
            .count();
        if has_connective || action_count >= 2 {
            TaskClass::Complex
        } else {
            TaskClass::Simple
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_form_send_shorthand() {
        let parsed = parse_fast("ss:张三:你好").unwrap();
        assert_eq!(
            parsed,
            ParsedTask::SendMessage {
                recipient: "张三".into(),
                content: "你好".into(),
            }
        );
        assert_eq!(parsed.type_name(), "send_msg");
        assert_eq!(parsed.task_class(), TaskClass::Simple);
    }

    #[test]
    fn fast_form_explicit_type_token() {
        let parsed = parse_fast("ss:msg:李四:明天见").unwrap();
        assert_eq!(
            parsed,
            ParsedTask::SendMessage {
                recipient: "李四".into(),
                content: "明天见".into(),
            }
        );
    }

    #[test]
    fn fast_form_moments() {
        let parsed = parse_fast("ss:朋友圈:今天天气真好").unwrap();
        assert_eq!(
            parsed,
            ParsedTask::PostMoment {
                content: "今天天气真好".into(),
            }
        );
        assert_eq!(parsed.type_name(), "post_moment_only_text");
    }

    #[test]
    fn fast_form_folds_fullwidth_colons() {
        let parsed = parse_fast("SS：pyq：不错").unwrap();
        assert_eq!(
            parsed,
            ParsedTask::PostMoment {
                content: "不错".into(),
            }
        );
    }

    #[test]
    fn excess_colons_stay_in_content() {
        let parsed = parse_fast("ss:张三:时间:下午3:00").unwrap();
        assert_eq!(
            parsed,
            ParsedTask::SendMessage {
                recipient: "张三".into(),
                content: "时间:下午3:00".into(),
            }
        );
    }

    #[test]
    fn malformed_fast_form_falls_through() {
        assert!(parse_fast("ss:李四").is_none());
        assert!(parse_fast("ss:").is_none());
        assert!(parse_fast("ss:msg:only_recipient").is_none());
        assert_eq!(strip_fast_prefix("ss:李四"), "李四");
    }

    #[test]
    fn bare_ss_is_natural_language() {
        assert!(!has_fast_prefix("ss"));
        assert!(parse_fast("ss").is_none());
    }

    #[test]
    fn canonical_form_strips_whitespace_and_folds_colons_only() {
        // Shorthand form: canonicalization is trim + colon folding, nothing
        // else. No type token appears that the user did not write.
        let canonical = canonicalize_fast(" ss：张三： 你好 ").unwrap();
        assert_eq!(canonical, "ss:张三:你好");

        // Explicit form: the synonym the user chose is preserved as-is.
        assert_eq!(
            canonicalize_fast("ss:msg:李四:明天见").unwrap(),
            "ss:msg:李四:明天见"
        );
    }

    #[test]
    fn canonicalization_preserves_parse_and_is_idempotent() {
        let u = " ss：张三：时间: 下午3:00 ";
        let canonical = canonicalize_fast(u).unwrap();
        assert_eq!(parse_fast(&canonical), parse_fast(u));
        assert_eq!(canonicalize_fast(&canonical).unwrap(), canonical);
    }

    #[test]
    fn malformed_input_has_no_canonical_form() {
        assert!(canonicalize_fast("ss:李四").is_none());
        assert!(canonicalize_fast("随便说说").is_none());
    }

    #[test]
    fn trivial_invalid_detection() {
        assert!(Classifier::is_trivially_invalid(""));
        assert!(Classifier::is_trivially_invalid("  "));
        assert!(Classifier::is_trivially_invalid("??"));
        assert!(Classifier::is_trivially_invalid("。"));
        assert!(!Classifier::is_trivially_invalid("aaa"));
        assert!(!Classifier::is_trivially_invalid("发消息"));
    }

    #[test]
    fn heuristic_flags_connectives_and_multi_action() {
        assert_eq!(
            Classifier::heuristic_class("打开微信然后发消息"),
            TaskClass::Complex
        );
        assert_eq!(
            Classifier::heuristic_class("搜索天气 回复朋友"),
            TaskClass::Complex
        );
        assert_eq!(Classifier::heuristic_class("打开微信"), TaskClass::Simple);
    }

    #[test]
    fn raw_conversion_demotes_incomplete_records() {
        let raw = RawParsed {
            task_type: "send_msg".into(),
            recipient: String::new(),
            content: "hi".into(),
        };
        assert_eq!(ParsedTask::from_raw(raw), ParsedTask::Invalid);

        let raw = RawParsed {
            task_type: "post_moment_only_text".into(),
            recipient: String::new(),
            content: "nice".into(),
        };
        assert_eq!(
            ParsedTask::from_raw(raw),
            ParsedTask::PostMoment {
                content: "nice".into(),
            }
        );
    }
}
