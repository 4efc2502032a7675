//! Shared adapter for the OpenAI-compatible provider family: OpenAI itself,
//! GitHub Copilot, DeepSeek, OpenRouter, Groq, Mistral, Perplexity and
//! Together — all speak the `/chat/completions` dialect with only headers
//! and the base path differing (spec §4.4).

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, Content, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

/// Drops image parts when `vision` is false rather than forwarding them to
/// an adapter that doesn't advertise vision support (spec §4.2).
fn content_to_openai(content: &Content, vision: bool) -> serde_json::Value {
    match content {
        Content::Text(text) => json!(text),
        Content::Parts(parts) => json!(parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::Image { media_type, base64 } if vision => Some(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{media_type};base64,{base64}")},
                })),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()),
    }
}

fn stop_reason_from_finish_reason(value: Option<&str>) -> Option<StopReason> {
    match value {
        Some("stop") | Some("eos") => Some(StopReason::EndTurn),
        Some("length") => Some(StopReason::MaxTokens),
        Some("content_filter") => Some(StopReason::StopSequence),
        Some(_) => Some(StopReason::EndTurn),
        None => None,
    }
}

#[derive(Clone)]
pub struct OpenAiCompatTransformer {
    name: &'static str,
    chat_path: &'static str,
    static_headers: Vec<(&'static str, &'static str)>,
    vision: bool,
}

impl OpenAiCompatTransformer {
    pub fn standard() -> Self {
        OpenAiCompatTransformer { name: "openai", chat_path: "/v1/chat/completions", static_headers: vec![], vision: true }
    }

    pub fn openrouter() -> Self {
        OpenAiCompatTransformer {
            name: "openrouter",
            chat_path: "/api/v1/chat/completions",
            static_headers: vec![
                ("HTTP-Referer", "https://github.com/resmp-dev/ucr-rust"),
                ("X-Title", "ucr-rust"),
            ],
            vision: true,
        }
    }

    pub fn deepseek() -> Self {
        OpenAiCompatTransformer { name: "deepseek", chat_path: "/chat/completions", static_headers: vec![], vision: false }
    }

    pub fn groq() -> Self {
        OpenAiCompatTransformer { name: "groq", chat_path: "/openai/v1/chat/completions", static_headers: vec![], vision: false }
    }

    pub fn mistral() -> Self {
        OpenAiCompatTransformer { name: "mistral", chat_path: "/v1/chat/completions", static_headers: vec![], vision: false }
    }

    pub fn perplexity() -> Self {
        OpenAiCompatTransformer { name: "perplexity", chat_path: "/chat/completions", static_headers: vec![], vision: false }
    }

    pub fn together() -> Self {
        OpenAiCompatTransformer { name: "together", chat_path: "/v1/chat/completions", static_headers: vec![], vision: true }
    }

    /// GitHub Copilot's chat endpoint additionally requires editor
    /// identification headers alongside the oauth bearer token (spec §4.2).
    /// The concrete values are also the defaults used when provider
    /// metadata doesn't override them (see `request()`).
    pub fn copilot() -> Self {
        OpenAiCompatTransformer { name: "copilot", chat_path: "/chat/completions", static_headers: vec![], vision: true }
    }
}

impl Transformer for OpenAiCompatTransformer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let mut messages = Vec::new();
        if let Some(system) = &canonical.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &canonical.messages {
            messages.push(json!({
                "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                "content": content_to_openai(&m.content, self.vision),
            }));
        }

        let mut body = json!({
            "model": canonical.model,
            "messages": messages,
            "stream": canonical.stream,
        });
        let obj = body.as_object_mut().expect("constructed as object");
        if let Some(mt) = canonical.sampling.max_tokens {
            obj.insert("max_tokens".into(), json!(mt));
        }
        if let Some(t) = canonical.sampling.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = canonical.sampling.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(k) = canonical.sampling.top_k {
            obj.insert("top_k".into(), json!(k));
        }
        if let Some(stop) = &canonical.sampling.stop_sequences {
            obj.insert("stop".into(), json!(stop));
        }

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &provider.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        for (k, v) in &self.static_headers {
            headers.push((k.to_string(), v.to_string()));
        }
        if self.name == "copilot" {
            let editor_version = provider.metadata_str("editorVersion").unwrap_or("vscode/1.85.0");
            let plugin_version = provider.metadata_str("editorPluginVersion").unwrap_or("copilot-chat/0.11.1");
            let user_agent = provider.metadata_str("userAgent").unwrap_or("GitHubCopilotChat/0.11.1");
            headers.push(("Editor-Version".to_string(), editor_version.to_string()));
            headers.push(("Editor-Plugin-Version".to_string(), plugin_version.to_string()));
            headers.push(("User-Agent".to_string(), user_agent.to_string()));
        }
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts {
            url: format!("{}{}", provider.base_url.trim_end_matches('/'), self.chat_path),
            headers,
            body,
        })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let choice = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .ok_or(AppError::UpstreamInvalidBody)?;

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(CanonicalResponse {
            id: raw.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentPart::Text { text }],
            model: raw.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stop_reason: stop_reason_from_finish_reason(choice.get("finish_reason").and_then(|v| v.as_str())),
            stop_sequence: None,
            usage: Usage {
                input_tokens: raw.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: raw.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            },
        })
    }

    /// Translate an OpenAI `data: {...}` delta line into a canonical
    /// Anthropic-shaped `content_block_delta` payload (spec §4.3 scenario S4).
    fn stream_chunk(&self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            return None;
        }
        let parsed: serde_json::Value = serde_json::from_str(payload).ok()?;
        let delta_text = parsed
            .get("choices")?
            .as_array()?
            .first()?
            .get("delta")?
            .get("content")?
            .as_str()?;
        if delta_text.is_empty() {
            return None;
        }
        Some(
            json!({
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": delta_text},
            })
            .to_string(),
        )
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }
}
