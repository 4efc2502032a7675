//! Native Anthropic `/v1/messages` adapter — closest thing to a passthrough,
//! since the canonical dialect is modeled directly on this API (spec §3).

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, Content, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

fn content_to_blocks(content: &Content) -> serde_json::Value {
    match content {
        Content::Text(text) => json!(text),
        Content::Parts(parts) => json!(parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { media_type, base64 } => json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": base64},
                }),
            })
            .collect::<Vec<_>>()),
    }
}

fn stop_reason_from_anthropic(value: Option<&str>) -> Option<StopReason> {
    match value {
        Some("end_turn") => Some(StopReason::EndTurn),
        Some("max_tokens") => Some(StopReason::MaxTokens),
        Some("stop_sequence") => Some(StopReason::StopSequence),
        Some(other) => Some(StopReason::Other(other.to_string())),
        None => None,
    }
}

pub struct AnthropicTransformer;

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let mut body = json!({
            "model": canonical.model,
            "messages": canonical.messages.iter().map(|m| json!({
                "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                "content": content_to_blocks(&m.content),
            })).collect::<Vec<_>>(),
            "max_tokens": canonical.sampling.max_tokens.unwrap_or(4096),
            "stream": canonical.stream,
        });
        let obj = body.as_object_mut().expect("constructed as object");
        if let Some(system) = &canonical.system {
            obj.insert("system".into(), json!(system));
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
            obj.insert("stop_sequences".into(), json!(stop));
        }

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ];
        if let Some(key) = &provider.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts {
            url: format!("{}/v1/messages", provider.base_url.trim_end_matches('/')),
            headers,
            body,
        })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let content: Vec<ContentPart> = raw
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                            Some(ContentPart::Text {
                                text: b.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
                            })
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id: raw.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: raw.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stop_reason: stop_reason_from_anthropic(raw.get("stop_reason").and_then(|v| v.as_str())),
            stop_sequence: raw.get("stop_sequence").and_then(|v| v.as_str()).map(|s| s.to_string()),
            usage: Usage {
                input_tokens: raw.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: raw.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            },
        })
    }

    /// Anthropic's stream already emits canonical-shaped SSE `data:` frames;
    /// forward each line unchanged.
    fn stream_chunk(&self, line: &str) -> Option<String> {
        Some(line.to_string())
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Message, SamplingParams};

    fn provider() -> Provider {
        Provider {
            id: "anthropic".into(),
            name: "Anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            default_model: None,
            models: vec![],
            auth_type: None,
            api_key: Some("sk-ant-test".into()),
            priority: 10,
            enabled: true,
            timeout_ms: None,
            retry_count: None,
            extra_headers: Default::default(),
            metadata: Default::default(),
        }
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            model: "claude-3-5-sonnet".into(),
            messages: vec![Message { role: Role::User, content: Content::Text("hi".into()) }],
            system: Some("be terse".into()),
            sampling: SamplingParams { max_tokens: Some(100), ..Default::default() },
            stream: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn request_targets_v1_messages_with_api_key_header() {
        let t = AnthropicTransformer;
        let parts = t.request(&request(), &provider()).unwrap();
        assert_eq!(parts.url, "https://api.anthropic.com/v1/messages");
        assert!(parts.headers.iter().any(|(k, v)| k == "x-api-key" && v == "sk-ant-test"));
        assert_eq!(parts.body["system"], "be terse");
    }

    #[test]
    fn image_part_becomes_base64_source_block() {
        let mut req = request();
        req.messages[0].content = Content::Parts(vec![ContentPart::Image {
            media_type: "image/png".into(),
            base64: "AAAA".into(),
        }]);
        let parts = AnthropicTransformer.request(&req, &provider()).unwrap();
        let block = &parts.body["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["data"], "AAAA");
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let raw = json!({
            "id": "msg_1", "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2},
        });
        let resp = AnthropicTransformer.response(&raw, &request()).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(resp.usage.input_tokens, 5);
    }

    #[test]
    fn unmapped_stop_reason_is_preserved_as_other() {
        let raw = json!({"id": "x", "model": "m", "content": [], "stop_reason": "model_length_exceeded", "usage": {}});
        let resp = AnthropicTransformer.response(&raw, &request()).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::Other("model_length_exceeded".into())));
    }
}
