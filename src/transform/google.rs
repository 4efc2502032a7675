//! Google Gemini adapter, dispatching between AI Studio (`x-goog-api-key`
//! header) and Vertex AI (OAuth bearer, project/location in the URL) based
//! on hostname inspection of `baseUrl` (spec §4.2).

use serde_json::json;

use crate::canonical::{CanonicalRequest, CanonicalResponse, Content, ContentPart, Role, StopReason, Usage};
use crate::config::Provider;
use crate::error::AppError;
use crate::transformer::{RequestParts, Transformer};

fn content_to_parts(content: &Content) -> Vec<serde_json::Value> {
    match content {
        Content::Text(text) => vec![json!({"text": text})],
        Content::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::Image { media_type, base64 } => {
                    json!({"inlineData": {"mimeType": media_type, "data": base64}})
                }
            })
            .collect(),
    }
}

fn stop_reason_from_finish_reason(value: Option<&str>) -> Option<StopReason> {
    match value {
        Some("STOP") => Some(StopReason::EndTurn),
        Some("MAX_TOKENS") => Some(StopReason::MaxTokens),
        Some("SAFETY") | Some("RECITATION") => Some(StopReason::StopSequence),
        Some(other) => Some(StopReason::Other(other.to_string())),
        None => None,
    }
}

/// Host is under `googleapis.com` AND some label ends with or equals
/// `aiplatform` or `vertexai` (spec §4.2).
fn is_vertex_host(base_url: &str) -> bool {
    let host = base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or("");
    if !host.ends_with("googleapis.com") {
        return false;
    }
    host.split('.')
        .any(|label| label == "aiplatform" || label == "vertexai" || label.ends_with("aiplatform") || label.ends_with("vertexai"))
}

struct Endpoint {
    url: String,
    headers: Vec<(String, String)>,
}

fn endpoint(provider: &Provider, model: &str) -> Endpoint {
    let base = provider.base_url.trim_end_matches('/');
    if is_vertex_host(base) {
        let project = provider.metadata_str("project").unwrap_or("default");
        let location = provider.metadata_str("location").unwrap_or("us-central1");
        let url = format!(
            "{base}/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent"
        );
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &provider.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        Endpoint { url, headers }
    } else {
        let url = format!("{base}/v1beta/models/{model}:generateContent");
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &provider.api_key {
            headers.push(("x-goog-api-key".to_string(), key.clone()));
        }
        Endpoint { url, headers }
    }
}

/// Merge consecutive same-role messages into a single turn, joining text
/// parts with `\n` and concatenating image parts in order (spec §4.2).
/// Applies unconditionally, with or without image content.
fn merge_consecutive_roles(messages: &[crate::canonical::Message]) -> Vec<(Role, Vec<serde_json::Value>)> {
    let mut merged: Vec<(Role, Vec<serde_json::Value>)> = Vec::new();
    for m in messages {
        let parts = content_to_parts(&m.content);
        match merged.last_mut() {
            Some((role, acc)) if *role == m.role => {
                if let (Some(prev), Some(first)) = (acc.last_mut(), parts.first()) {
                    if let (Some(prev_text), Some(next_text)) = (
                        prev.get("text").and_then(|v| v.as_str()).map(str::to_string),
                        first.get("text").and_then(|v| v.as_str()),
                    ) {
                        *prev = json!({"text": format!("{prev_text}\n{next_text}")});
                        acc.extend(parts.into_iter().skip(1));
                        continue;
                    }
                }
                acc.extend(parts);
            }
            _ => merged.push((m.role.clone(), parts)),
        }
    }
    merged
}

pub struct GoogleTransformer;

impl Transformer for GoogleTransformer {
    fn name(&self) -> &'static str {
        "google"
    }

    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError> {
        let contents: Vec<serde_json::Value> = merge_consecutive_roles(&canonical.messages)
            .into_iter()
            .map(|(role, parts)| {
                json!({
                    "role": match role { Role::User => "user", Role::Assistant => "model" },
                    "parts": parts,
                })
            })
            .collect();

        let mut body = json!({"contents": contents});
        let obj = body.as_object_mut().expect("constructed as object");
        if let Some(system) = &canonical.system {
            obj.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(mt) = canonical.sampling.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(mt));
        }
        if let Some(t) = canonical.sampling.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = canonical.sampling.top_p {
            generation_config.insert("topP".into(), json!(p));
        }
        if let Some(k) = canonical.sampling.top_k {
            generation_config.insert("topK".into(), json!(k));
        }
        if let Some(stop) = &canonical.sampling.stop_sequences {
            generation_config.insert("stopSequences".into(), json!(stop));
        }
        if !generation_config.is_empty() {
            obj.insert("generationConfig".into(), serde_json::Value::Object(generation_config));
        }

        let ep = endpoint(provider, &canonical.model);
        let mut headers = ep.headers;
        for (k, v) in &provider.extra_headers {
            headers.push((k.clone(), v.clone()));
        }

        Ok(RequestParts { url: ep.url, headers, body })
    }

    fn response(&self, raw: &serde_json::Value, _original: &CanonicalRequest) -> Result<CanonicalResponse, AppError> {
        let candidate = raw
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .ok_or(AppError::UpstreamInvalidBody)?;

        let content: Vec<ContentPart> = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .map(|t| ContentPart::Text { text: t.to_string() })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id: uuid::Uuid::new_v4().to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: raw.get("modelVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stop_reason: stop_reason_from_finish_reason(candidate.get("finishReason").and_then(|v| v.as_str())),
            stop_sequence: None,
            usage: Usage {
                input_tokens: raw.get("usageMetadata").and_then(|u| u.get("promptTokenCount")).and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: raw.get("usageMetadata").and_then(|u| u.get("candidatesTokenCount")).and_then(|v| v.as_u64()).unwrap_or(0),
            },
        })
    }

    fn stream_chunk(&self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        let parsed: serde_json::Value = serde_json::from_str(payload).ok()?;
        let text = parsed
            .get("candidates")?
            .as_array()?
            .first()?
            .get("content")?
            .get("parts")?
            .as_array()?
            .first()?
            .get("text")?
            .as_str()?;
        if text.is_empty() {
            return None;
        }
        Some(
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}).to_string(),
        )
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Message, SamplingParams};

    fn ai_studio_provider() -> Provider {
        Provider {
            id: "google".into(),
            name: "Google AI Studio".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            default_model: None,
            models: vec![],
            auth_type: None,
            api_key: Some("ai-studio-key".into()),
            priority: 3,
            enabled: true,
            timeout_ms: None,
            retry_count: None,
            extra_headers: Default::default(),
            metadata: Default::default(),
        }
    }

    fn vertex_provider() -> Provider {
        let mut p = ai_studio_provider();
        p.id = "vertex".into();
        p.base_url = "https://us-east1-aiplatform.googleapis.com".into();
        p.api_key = Some("oauth-token".into());
        p.metadata.insert("project".into(), json!("my-project"));
        p.metadata.insert("location".into(), json!("us-east1"));
        p
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            model: "gemini-1.5-pro".into(),
            messages: vec![Message { role: Role::User, content: Content::Text("hi".into()) }],
            system: Some("be terse".into()),
            sampling: SamplingParams::default(),
            stream: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn ai_studio_uses_header_not_query_string() {
        let parts = GoogleTransformer.request(&request(), &ai_studio_provider()).unwrap();
        assert!(!parts.url.contains("key="));
        assert!(parts.headers.iter().any(|(k, v)| k == "x-goog-api-key" && v == "ai-studio-key"));
        assert!(!parts.headers.iter().any(|(k, _)| k == "authorization"));
    }

    #[test]
    fn vertex_uses_bearer_auth_and_project_location_path() {
        let parts = GoogleTransformer.request(&request(), &vertex_provider()).unwrap();
        assert!(parts.url.contains("my-project"));
        assert!(parts.url.contains("us-east1-aiplatform.googleapis.com"));
        assert!(parts.headers.iter().any(|(k, v)| k == "authorization" && v == "Bearer oauth-token"));
    }

    #[test]
    fn consecutive_user_messages_merge_with_newline() {
        let mut req = request();
        req.messages = vec![
            Message { role: Role::User, content: Content::Text("a".into()) },
            Message { role: Role::User, content: Content::Text("b".into()) },
        ];
        let parts = GoogleTransformer.request(&req, &ai_studio_provider()).unwrap();
        let contents = parts.body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "a\nb");
    }

    #[test]
    fn consecutive_same_role_messages_merge_even_with_images() {
        let mut req = request();
        req.messages = vec![
            Message {
                role: Role::User,
                content: Content::Parts(vec![
                    ContentPart::Text { text: "look at this".into() },
                    ContentPart::Image { media_type: "image/png".into(), base64: "AAAA".into() },
                ]),
            },
            Message { role: Role::User, content: Content::Text("what is it".into()) },
        ];
        let parts = GoogleTransformer.request(&req, &ai_studio_provider()).unwrap();
        let contents = parts.body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        let turn_parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(turn_parts[0]["text"], "look at this");
        assert!(turn_parts[1].get("inlineData").is_some());
        assert_eq!(turn_parts[2]["text"], "what is it");
    }

    #[test]
    fn assistant_role_renamed_to_model() {
        let mut req = request();
        req.messages.push(crate::canonical::Message { role: Role::Assistant, content: Content::Text("ok".into()) });
        let parts = GoogleTransformer.request(&req, &ai_studio_provider()).unwrap();
        assert_eq!(parts.body["contents"][1]["role"], "model");
    }

    #[test]
    fn response_maps_finish_reason_and_usage() {
        let raw = json!({
            "modelVersion": "gemini-1.5-pro",
            "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2},
        });
        let resp = GoogleTransformer.response(&raw, &request()).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(resp.usage.input_tokens, 4);
    }

    #[test]
    fn safety_and_recitation_map_to_stop_sequence() {
        assert_eq!(stop_reason_from_finish_reason(Some("SAFETY")), Some(StopReason::StopSequence));
        assert_eq!(stop_reason_from_finish_reason(Some("RECITATION")), Some(StopReason::StopSequence));
    }
}
