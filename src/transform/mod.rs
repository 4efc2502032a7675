//! Per-provider `Transformer` adapters (spec §4.2/§4.4).

pub mod anthropic;
pub mod cohere;
pub mod google;
pub mod ollama;
pub mod openai_compat;
pub mod replicate;
