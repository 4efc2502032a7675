//! Canonical request/response dialect (spec §3).
//!
//! This is the wire shape the proxy accepts from clients and always
//! returns to them, modeled on Anthropic's `/v1/messages`. Every
//! Transformer adapter converts to and from this shape.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, base64: String },
}

/// A message's content: either a bare string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text across all text parts (images contribute nothing).
    pub fn text_chars(&self) -> usize {
        match self {
            Content::Text(s) => s.chars().count(),
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::Image { .. } => 0,
                })
                .sum(),
        }
    }

    /// Concatenated text across all text parts, case preserved (images
    /// contribute nothing). Used by adapters that flatten content into a
    /// single string field, e.g. Cohere's `message`/`chat_history`.
    pub fn plain_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn lowercased_text(&self) -> String {
        match self {
            Content::Text(s) => s.to_lowercase(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.to_lowercase()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, Content::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Content::Text(_) => 0,
            Content::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Image { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CanonicalRequest {
    /// Validate against the invariants in spec §3. Returns the first
    /// violation found.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.messages.is_empty() {
            return Err(AppError::RequestInvalid("messages must not be empty".into()));
        }
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.content.is_empty() {
                return Err(AppError::RequestInvalid(format!(
                    "message {i} has empty content"
                )));
            }
        }
        if let Some(t) = self.sampling.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AppError::RequestInvalid(
                    "temperature must be in [0, 2]".into(),
                ));
            }
        }
        if let Some(p) = self.sampling.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(AppError::RequestInvalid("top_p must be in [0, 1]".into()));
            }
        }
        if let Some(mt) = self.sampling.max_tokens {
            if mt < 1 {
                return Err(AppError::RequestInvalid("max_tokens must be >= 1".into()));
            }
        }
        Ok(())
    }

    /// Total text characters across every message, plus the system prompt.
    pub fn total_text_chars(&self) -> usize {
        let messages: usize = self.messages.iter().map(|m| m.content.text_chars()).sum();
        let system = self.system.as_ref().map(|s| s.chars().count()).unwrap_or(0);
        messages + system
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    /// Decision recorded in DESIGN.md: resolves spec §9's Open Question by
    /// preserving providers' unmapped finish reasons instead of silently
    /// folding them into `StopSequence`.
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl CanonicalResponse {
    pub fn text(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        CanonicalResponse {
            id: id.into(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentPart::Text { text: text.into() }],
            model: model.into(),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: Content::Text(text.to_string()),
        }
    }

    #[test]
    fn rejects_empty_messages() {
        let req = CanonicalRequest {
            model: "m".into(),
            messages: vec![],
            system: None,
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut req = CanonicalRequest {
            model: "m".into(),
            messages: vec![msg(Role::User, "hi")],
            system: None,
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        };
        req.sampling.temperature = Some(3.0);
        assert!(req.validate().is_err());
        req.sampling.temperature = Some(1.5);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn total_text_chars_includes_system() {
        let req = CanonicalRequest {
            model: "m".into(),
            messages: vec![msg(Role::User, "hello")],
            system: Some("abc".into()),
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        };
        assert_eq!(req.total_text_chars(), 5 + 3);
    }

    #[test]
    fn last_user_message_skips_assistant() {
        let req = CanonicalRequest {
            model: "m".into(),
            messages: vec![msg(Role::User, "a"), msg(Role::Assistant, "b"), msg(Role::User, "c")],
            system: None,
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        };
        let last = req.last_user_message().unwrap();
        assert_eq!(last.content, Content::Text("c".to_string()));
    }
}
