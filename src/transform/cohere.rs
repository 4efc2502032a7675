//! Cohere Chat API adapter: splits canonical messages into the most recent
//! user turn plus a `chat_history` list, with `system` becoming `preamble`
//! (spec §4.4).

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

fn stop_reason_from_finish_reason(value: Option<&str>) -> Option<StopReason> {
    match value {
        Some("COMPLETE") => Some(StopReason::EndTurn),
        Some("MAX_TOKENS") => Some(StopReason::MaxTokens),
        Some(other) => Some(StopReason::Other(other.to_string())),
        None => None,
    }
}

pub struct CohereTransformer;

impl Transformer for CohereTransformer {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let latest_index = canonical.messages.iter().rposition(|m| m.role == Role::User);
        let latest_message = latest_index
            .map(|i| canonical.messages[i].content.plain_text())
            .unwrap_or_default();
        let history: Vec<serde_json::Value> = canonical
            .messages
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != latest_index)
            .map(|(_, m)| {
                json!({
                    "role": match m.role { Role::User => "USER", Role::Assistant => "CHATBOT" },
                    "message": m.content.plain_text(),
                })
            })
            .collect();

        let mut body = json!({
            "model": canonical.model,
            "message": latest_message,
            "chat_history": history,
            "stream": canonical.stream,
        });
        let obj = body.as_object_mut().expect("constructed as object");
        if let Some(system) = &canonical.system {
            obj.insert("preamble".into(), json!(system));
        }
        if let Some(mt) = canonical.sampling.max_tokens {
            obj.insert("max_tokens".into(), json!(mt));
        }
        if let Some(t) = canonical.sampling.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = canonical.sampling.top_p {
            obj.insert("p".into(), json!(p));
        }
        if let Some(k) = canonical.sampling.top_k {
            obj.insert("k".into(), json!(k));
        }
        if let Some(stop) = &canonical.sampling.stop_sequences {
            obj.insert("stop_sequences".into(), json!(stop));
        }

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &provider.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts {
            url: format!("{}/v1/chat", provider.base_url.trim_end_matches('/')),
            headers,
            body,
        })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let text = raw.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(CanonicalResponse {
            id: raw.get("generation_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentPart::Text { text }],
            model: raw.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stop_reason: stop_reason_from_finish_reason(raw.get("finish_reason").and_then(|v| v.as_str())),
            stop_sequence: None,
            usage: Usage {
                input_tokens: raw
                    .get("meta")
                    .and_then(|m| m.get("billed_units"))
                    .and_then(|b| b.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                output_tokens: raw
                    .get("meta")
                    .and_then(|m| m.get("billed_units"))
                    .and_then(|b| b.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            },
        })
    }

    fn stream_chunk(&self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        let parsed: serde_json::Value = serde_json::from_str(payload).ok()?;
        if parsed.get("event_type").and_then(|v| v.as_str()) != Some("text-generation") {
            return None;
        }
        let text = parsed.get("text")?.as_str()?;
        Some(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}).to_string())
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{CanonicalRequest, Content, Message, SamplingParams};

    fn provider() -> Provider {
        Provider {
            id: "cohere".into(),
            name: "Cohere".into(),
            base_url: "https://api.cohere.ai".into(),
            default_model: None,
            models: vec![],
            auth_type: None,
            api_key: Some("co-key".into()),
            priority: 1,
            enabled: true,
            timeout_ms: None,
            retry_count: None,
            extra_headers: Default::default(),
            metadata: Default::default(),
        }
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            model: "command-r-plus".into(),
            messages: vec![
                Message { role: Role::User, content: Content::Text("hello".into()) },
                Message { role: Role::Assistant, content: Content::Text("hi there".into()) },
                Message { role: Role::User, content: Content::Text("how are you".into()) },
            ],
            system: Some("be concise".into()),
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn splits_history_from_latest_message() {
        let parts = CohereTransformer.request(&request(), &provider()).unwrap();
        assert_eq!(parts.body["message"], "how are you");
        assert_eq!(parts.body["chat_history"].as_array().unwrap().len(), 2);
        assert_eq!(parts.body["chat_history"][1]["role"], "CHATBOT");
    }

    #[test]
    fn latest_message_is_last_user_turn_not_literal_last_message() {
        let mut req = request();
        req.messages.push(crate::canonical::Message {
            role: Role::Assistant,
            content: Content::Text("trailing aside".into()),
        });
        let parts = CohereTransformer.request(&req, &provider()).unwrap();
        assert_eq!(parts.body["message"], "how are you");
        let history = parts.body["chat_history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap()["message"], "trailing aside");
    }

    #[test]
    fn system_becomes_preamble() {
        let parts = CohereTransformer.request(&request(), &provider()).unwrap();
        assert_eq!(parts.body["preamble"], "be concise");
    }

    #[test]
    fn response_maps_billed_units_to_usage() {
        let raw = json!({
            "generation_id": "g1", "model": "command-r-plus", "text": "ok",
            "finish_reason": "COMPLETE",
            "meta": {"billed_units": {"input_tokens": 7, "output_tokens": 3}},
        });
        let resp = CohereTransformer.response(&raw, &request()).unwrap();
        assert_eq!(resp.usage.input_tokens, 7);
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    }
}
