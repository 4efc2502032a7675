//! The `Transformer` trait and registry (spec §4.2).
//!
//! Transformers are stateless singletons, one per provider adapter,
//! converting between the canonical dialect and a provider's wire format.

use std::collections::HashMap;
use std::sync::Arc;

use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::config::Provider;
use crate::error::AppError;

/// The pieces needed to issue an upstream HTTP request: URL, headers and
/// JSON body, already in the provider's native shape.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Converts between the canonical dialect and one provider's wire format.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the upstream request for `canonical` against `provider`.
    fn request(&self, canonical: &CanonicalRequest, provider: &Provider) -> Result<RequestParts, AppError>;

    /// Parse a buffered (non-streaming) upstream response body back into
    /// the canonical dialect.
    fn response(
        &self,
        raw_body: &serde_json::Value,
        original: &CanonicalRequest,
    ) -> Result<CanonicalResponse, AppError>;

    /// Translate one line of an upstream stream into a canonical SSE data
    /// payload. `None` means "drop this line" (e.g. a heartbeat or a
    /// `[DONE]` sentinel already handled by the SSE layer).
    fn stream_chunk(&self, _line: &str) -> Option<String> {
        None
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Whether this adapter's wire format accepts image content parts.
    /// Adapters that don't advertise vision drop image parts rather than
    /// forwarding them upstream (spec §4.2).
    fn supports_vision(&self) -> bool {
        false
    }
}

/// Registry of stateless transformer singletons, keyed by adapter name
/// (spec §4.7's `transformers[].provider`, defaulting to the provider id
/// when no explicit adapter name is configured).
#[derive(Clone)]
pub struct TransformerRegistry {
    adapters: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        TransformerRegistry {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, transformer: Arc<dyn Transformer>) {
        self.adapters.insert(name, transformer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.adapters.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Builds the registry with every built-in adapter wired under its
    /// canonical name (spec §4.2/§4.4).
    pub fn with_builtins() -> Self {
        let mut registry = TransformerRegistry::new();
        registry.register("anthropic", Arc::new(crate::transform::anthropic::AnthropicTransformer));

        let openai_compat = crate::transform::openai_compat::OpenAiCompatTransformer::standard();
        registry.register("openai", Arc::new(openai_compat.clone()));
        registry.register("openrouter", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::openrouter()));
        registry.register("deepseek", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::deepseek()));
        registry.register("groq", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::groq()));
        registry.register("mistral", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::mistral()));
        registry.register("perplexity", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::perplexity()));
        registry.register("together", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::together()));
        registry.register("copilot", Arc::new(crate::transform::openai_compat::OpenAiCompatTransformer::copilot()));

        registry.register("google", Arc::new(crate::transform::google::GoogleTransformer));
        registry.register("cohere", Arc::new(crate::transform::cohere::CohereTransformer));
        registry.register("ollama", Arc::new(crate::transform::ollama::OllamaTransformer));
        registry.register("replicate", Arc::new(crate::transform::replicate::ReplicateTransformer));
        registry
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
