//! Replicate adapter: `/v1/predictions`, a single flattened
//! `User:`/`Assistant:` prompt string rather than a messages array, and
//! asynchronous prediction polling instead of a direct response body
//! (spec §4.4). Replicate doesn't report token usage, so `Usage` is left
//! at its default.

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

fn build_prompt(canonical: &CanonicalRequest) -> String {
    let mut lines = Vec::new();
    if let Some(system) = &canonical.system {
        lines.push(system.clone());
    }
    for m in &canonical.messages {
        let label = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        lines.push(format!("{label}: {}", m.content.plain_text()));
    }
    lines.push("Assistant:".to_string());
    lines.join("\n")
}

pub struct ReplicateTransformer;

impl Transformer for ReplicateTransformer {
    fn name(&self) -> &'static str {
        "replicate"
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let mut input = json!({"prompt": build_prompt(canonical)});
        let obj = input.as_object_mut().expect("constructed as object");
        if let Some(mt) = canonical.sampling.max_tokens {
            obj.insert("max_new_tokens".into(), json!(mt));
        }
        if let Some(t) = canonical.sampling.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = canonical.sampling.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(stop) = &canonical.sampling.stop_sequences {
            obj.insert("stop_sequences".into(), json!(stop.join(",")));
        }

        let body = json!({
            "version": canonical.model,
            "input": input,
            "stream": canonical.stream,
        });

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &provider.api_key {
            headers.push(("authorization".to_string(), format!("Token {key}")));
        }
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts {
            url: format!("{}/v1/predictions", provider.base_url.trim_end_matches('/')),
            headers,
            body,
        })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let output = raw.get("output").ok_or(AppError::UpstreamInvalidBody)?;
        let text = if let Some(arr) = output.as_array() {
            arr.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join("")
        } else {
            output.as_str().unwrap_or_default().to_string()
        };

        let status = raw.get("status").and_then(|v| v.as_str());
        let stop_reason = match status {
            Some("succeeded") => Some(StopReason::EndTurn),
            Some("failed") | Some("canceled") => Some(StopReason::Other(status.unwrap().to_string())),
            _ => None,
        };

        Ok(CanonicalResponse {
            id: raw.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ContentPart::Text { text }],
            model: raw
                .get("version")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stop_reason,
            stop_sequence: None,
            usage: Usage::default(),
        })
    }

    /// Replicate's streaming URL emits bare SSE `data:` lines carrying
    /// raw text tokens, not JSON envelopes.
    fn stream_chunk(&self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        Some(
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": payload}})
                .to_string(),
        )
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
