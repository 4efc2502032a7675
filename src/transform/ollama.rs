//! Ollama local-model adapter: `/api/chat`, arbitrary sampling params in
//! an `options` bag, newline-delimited JSON streaming (not SSE) (spec §4.4).

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

pub struct OllamaTransformer;

impl Transformer for OllamaTransformer {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let mut messages = Vec::new();
        if let Some(system) = &canonical.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &canonical.messages {
            messages.push(json!({
                "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                "content": m.content.plain_text(),
            }));
        }

        let mut options = serde_json::Map::new();
        if let Some(t) = canonical.sampling.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = canonical.sampling.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(k) = canonical.sampling.top_k {
            options.insert("top_k".into(), json!(k));
        }
        if let Some(mt) = canonical.sampling.max_tokens {
            options.insert("num_predict".into(), json!(mt));
        }
        if let Some(stop) = &canonical.sampling.stop_sequences {
            options.insert("stop".into(), json!(stop));
        }

        let mut body = json!({
            "model": canonical.model,
            "messages": messages,
            "stream": canonical.stream,
        });
        if !options.is_empty() {
            body.as_object_mut().unwrap().insert("options".into(), serde_json::Value::Object(options));
        }

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts {
            url: format!("{}/api/chat", provider.base_url.trim_end_matches('/')),
            headers,
            body,
        })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let text = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let done_reason = raw.get("done_reason").and_then(|v| v.as_str());

        Ok(CanonicalResponse {
            id: uuid::Uuid::new_v4().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentPart::Text { text }],
            model: raw.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stop_reason: match done_reason {
                Some("stop") => Some(StopReason::EndTurn),
                Some("length") => Some(StopReason::MaxTokens),
                Some(other) => Some(StopReason::Other(other.to_string())),
                None => None,
            },
            stop_sequence: None,
            usage: Usage {
                input_tokens: raw.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: raw.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
            },
        })
    }

    /// Ollama streams newline-delimited JSON objects, not SSE `data:`
    /// frames — each line is itself a full JSON chat response fragment.
    fn stream_chunk(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let parsed: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let text = parsed.get("message")?.get("content")?.as_str()?;
        if text.is_empty() {
            return None;
        }
        Some(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}).to_string())
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Content, Message, SamplingParams};

    fn provider() -> Provider {
        Provider {
            id: "ollama".into(),
            name: "Ollama".into(),
            base_url: "http://localhost:11434".into(),
            default_model: None,
            models: vec![],
            auth_type: None,
            api_key: None,
            priority: 0,
            enabled: true,
            timeout_ms: None,
            retry_count: None,
            extra_headers: Default::default(),
            metadata: Default::default(),
        }
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            model: "llama3".into(),
            messages: vec![Message { role: Role::User, content: Content::Text("hi".into()) }],
            system: None,
            sampling: SamplingParams { temperature: Some(0.7), ..Default::default() },
            stream: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn request_targets_api_chat_with_options_bag() {
        let parts = OllamaTransformer.request(&request(), &provider()).unwrap();
        assert_eq!(parts.url, "http://localhost:11434/api/chat");
        assert_eq!(parts.body["options"]["temperature"], 0.7);
    }

    #[test]
    fn response_maps_eval_counts_to_usage() {
        let raw = json!({
            "model": "llama3", "message": {"content": "hi there"},
            "done_reason": "stop", "prompt_eval_count": 10, "eval_count": 4,
        });
        let resp = OllamaTransformer.response(&raw, &request()).unwrap();
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn stream_chunk_parses_ndjson_not_sse() {
        let line = r#"{"message":{"content":"partial"}}"#;
        let translated = OllamaTransformer.stream_chunk(line).unwrap();
        assert!(translated.contains("partial"));
    }
}
