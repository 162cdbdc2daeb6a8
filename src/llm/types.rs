use serde::{Deserialize, Serialize};

use crate::types::FailureReason;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "assistant".into(),
            content: MessageContent::Parts(parts),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    /// Builds a base64 image source, normalizing the declared media type.
    pub fn base64(media_type: &str, data: String) -> Self {
        Self {
            source_type: "base64".into(),
            media_type: normalize_media_type(media_type),
            data,
        }
    }
}

/// Rewrites the non-standard `image/jpg` alias to `image/jpeg`; some model
/// backends reject the alias. All other types pass through unchanged.
pub fn normalize_media_type(media_type: &str) -> String {
    if media_type.eq_ignore_ascii_case("image/jpg") {
        "image/jpeg".to_string()
    } else {
        media_type.to_string()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One model turn: accumulated text plus at most one tool request. A reply
/// without a tool request is a completion verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    pub tool_use: Option<ToolUse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Structured terminal verdict the model is asked to emit instead of a tool
/// call once it considers the scenario finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub current_step: Option<u32>,
    #[serde(default)]
    pub next_expected_action: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    InProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpg_alias_is_rewritten() {
        assert_eq!(normalize_media_type("image/jpg"), "image/jpeg");
        assert_eq!(normalize_media_type("image/JPG"), "image/jpeg");
    }

    #[test]
    fn standard_types_pass_through() {
        assert_eq!(normalize_media_type("image/png"), "image/png");
        assert_eq!(normalize_media_type("image/jpeg"), "image/jpeg");
        assert_eq!(normalize_media_type("image/webp"), "image/webp");
    }

    #[test]
    fn image_source_normalizes_on_construction() {
        let source = ImageSource::base64("image/jpg", "AAAA".into());
        assert_eq!(source.media_type, "image/jpeg");
        assert_eq!(source.source_type, "base64");
    }

    #[test]
    fn structured_result_parses_camel_case() {
        let json = r#"{"status":"failure","message":"button missing","failureReason":"element_not_found","currentStep":2}"#;
        let parsed: StructuredResult = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, ResultStatus::Failure);
        assert_eq!(parsed.failure_reason, Some(FailureReason::ElementNotFound));
        assert_eq!(parsed.current_step, Some(2));
    }
}
