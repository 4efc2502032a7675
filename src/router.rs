//! Task classification and provider selection (spec §4.1).

use crate::canonical::{CanonicalRequest, Content, Role};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{Config, Provider, RouterConfig};
use crate::error::AppError;
use crate::latency::EwmaTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Image,
    WebSearch,
    Background,
    Think,
    LongContext,
    Default,
}

impl TaskType {
    fn as_str(&self) -> &'static str {
        match self {
            TaskType::Image => "image",
            TaskType::WebSearch => "webSearch",
            TaskType::Background => "background",
            TaskType::Think => "think",
            TaskType::LongContext => "longContext",
            TaskType::Default => "default",
        }
    }
}

const WEB_SEARCH_KEYWORDS: &[&str] = &[
    "search for", "look up", "find information about", "what is the latest",
    "current events", "recent news", "browse", "web search",
];
const BACKGROUND_KEYWORDS: &[&str] = &[
    "in the background", "asynchronously", "run this later", "schedule", "batch process",
];
const THINK_KEYWORDS: &[&str] = &[
    "think about", "analyze", "reason through", "step by step", "explain why",
    "reasoning", "let's think", "chain of thought",
];

const LONG_CONTEXT_CHAR_THRESHOLD: usize = 50_000;

/// Classify the task by inspecting only the most recent user message
/// (spec §4.1 step 1, precedence per P4: image > webSearch > background >
/// think > longContext > default).
pub fn classify_task(request: &CanonicalRequest) -> TaskType {
    let Some(last_user) = request.last_user_message() else {
        return TaskType::Default;
    };

    if last_user.content.has_image() {
        return TaskType::Image;
    }

    let text = last_user.content.lowercased_text();
    if WEB_SEARCH_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return TaskType::WebSearch;
    }
    if BACKGROUND_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return TaskType::Background;
    }
    if THINK_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return TaskType::Think;
    }

    let total_chars: usize = request.messages.iter().map(|m| m.content.text_chars()).sum();
    if total_chars > LONG_CONTEXT_CHAR_THRESHOLD {
        return TaskType::LongContext;
    }

    TaskType::Default
}

/// `ceil(totalTextChars / 4) + 4*msgCount + (system ? ceil(len(system)/4)+4 : 0) + 10`,
/// images counting 1000 each (spec §4.1 step 2).
pub fn estimate_token_count(request: &CanonicalRequest) -> u64 {
    let text_chars: usize = request.messages.iter().map(|m| m.content.text_chars()).sum();
    let image_count: usize = request.messages.iter().map(|m| m.content.image_count()).sum();
    let msg_count = request.messages.len();

    let mut total = div_ceil(text_chars as u64, 4) + 4 * msg_count as u64;
    if let Some(system) = &request.system {
        total += div_ceil(system.chars().count() as u64, 4) + 4;
    }
    total += 10;
    total += 1000 * image_count as u64;
    total
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub provider_id: String,
    pub model: String,
    pub task_type: &'static str,
    pub token_count: u64,
    pub reason: String,
}

/// A user-supplied routing hook: `(request, taskType, tokenCount) ->
/// Option<providerId>` (spec §4.1's custom router contract). Errors are
/// logged and never fatal — the default path always applies.
pub trait CustomRouter: Send + Sync {
    fn route(&self, request: &CanonicalRequest, task_type: &str, token_count: u64) -> Option<String>;
}

/// Invokes `router.customRouter` as a subprocess once per request, feeding
/// `{request, taskType, tokenCount}` on stdin and reading a bare provider id
/// (or empty output) from stdout. Built once at config-apply time and
/// reused for the life of that config snapshot (spec §4.1).
pub struct ProcessCustomRouter {
    command: String,
}

impl ProcessCustomRouter {
    pub fn new(command: impl Into<String>) -> Self {
        ProcessCustomRouter { command: command.into() }
    }
}

impl CustomRouter for ProcessCustomRouter {
    fn route(&self, request: &CanonicalRequest, task_type: &str, token_count: u64) -> Option<String> {
        use std::io::Write;
        use std::process::{Command, Stdio};

        let payload = serde_json::json!({
            "request": request,
            "taskType": task_type,
            "tokenCount": token_count,
        });

        let mut child = match Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(command = %self.command, error = %err, "customRouter failed to spawn");
                return None;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(payload.to_string().as_bytes()) {
                tracing::warn!(command = %self.command, error = %err, "customRouter stdin write failed");
                return None;
            }
        }

        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(command = %self.command, error = %err, "customRouter failed to complete");
                return None;
            }
        };

        if !output.status.success() {
            tracing::warn!(command = %self.command, status = %output.status, "customRouter exited non-zero");
            return None;
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// Ties broken by insertion order: `Iterator::max_by_key` would keep the
/// *last* maximal element, so this folds manually, keeping the first-seen
/// max (spec §4.1 step 3).
fn highest_priority_enabled<'a>(providers: &[&'a Provider]) -> Option<&'a Provider> {
    let mut best: Option<&'a Provider> = None;
    for p in providers.iter().copied() {
        match best {
            Some(b) if p.priority > b.priority => best = Some(p),
            None => best = Some(p),
            _ => {}
        }
    }
    best
}

fn task_specific_route(router: &RouterConfig, task_type: TaskType) -> Option<&str> {
    match task_type {
        TaskType::Image => router.image.as_deref(),
        TaskType::WebSearch => router.web_search.as_deref(),
        TaskType::Background => router.background.as_deref(),
        TaskType::Think => router.think.as_deref(),
        TaskType::LongContext => router.long_context.as_deref(),
        TaskType::Default => None,
    }
}

/// Routes a validated canonical request against a config snapshot (spec
/// §4.1). Deterministic: same request + same config ⇒ same `RouteResult`
/// (P3) — this function takes no mutable external state besides the
/// optional custom router hook, which itself degrades to the
/// deterministic path on any failure.
pub fn route(
    request: &CanonicalRequest,
    config: &Config,
    custom_router: Option<&dyn CustomRouter>,
) -> Result<RouteResult, AppError> {
    let task_type = classify_task(request);
    let token_count = estimate_token_count(request);

    let enabled: Vec<&Provider> = config.enabled_providers_by_priority();
    if enabled.is_empty() {
        return Err(AppError::NoProviderAvailable);
    }

    let router_config = config.router();

    let mut candidate: Option<String> = None;
    let mut reason = String::new();

    if let Some(custom) = custom_router {
        if let Some(id) = custom.route(request, task_type.as_str(), token_count) {
            if enabled.iter().any(|p| p.id == id) {
                candidate = Some(id);
                reason = "customRouter".to_string();
            } else {
                tracing::debug!(provider = %id, "customRouter returned an unknown or disabled provider, ignoring");
            }
        }
    }

    if candidate.is_none() {
        let is_long_context = task_type == TaskType::LongContext || token_count > router_config.token_threshold;
        if is_long_context {
            if let Some(id) = &router_config.long_context {
                candidate = Some(id.clone());
                reason = "longContext".to_string();
            }
        }
        if candidate.is_none() {
            if let Some(id) = task_specific_route(router_config, task_type) {
                candidate = Some(id.to_string());
                reason = format!("taskType:{}", task_type.as_str());
            }
        }
        if candidate.is_none() {
            candidate = Some(router_config.default.clone());
            reason = "default".to_string();
        }
    }

    let resolved_id = candidate.expect("candidate always set above");
    let provider = enabled.iter().find(|p| p.id == resolved_id).copied();

    let (provider, reason) = match provider {
        Some(p) => (p, reason),
        None => {
            // Graceful degradation: simple tier (default or top-priority).
            if let Some(p) = enabled.iter().find(|p| p.id == router_config.default) {
                (*p, format!("{reason}->fallback:default"))
            } else if let Some(p) = highest_priority_enabled(&enabled) {
                (p, format!("{reason}->fallback:topPriority"))
            } else {
                return Err(AppError::NoProviderAvailable);
            }
        }
    };

    let model = provider.default_model.clone().unwrap_or_else(|| request.model.clone());

    tracing::debug!(
        provider = %provider.id,
        task_type = task_type.as_str(),
        token_count,
        reason = %reason,
        "routed request"
    );

    Ok(RouteResult {
        provider_id: provider.id.clone(),
        model,
        task_type: task_type.as_str(),
        token_count,
        reason,
    })
}

/// Bundles the router's auxiliary signals (spec ADDED-4): the circuit
/// breaker gates provider eligibility at request time, and the EWMA
/// tracker feeds metrics/backoff but never reorders selection.
pub struct Router {
    pub circuit_breaker: CircuitBreaker,
    pub latency: EwmaTracker,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            circuit_breaker: CircuitBreaker::new(),
            latency: EwmaTracker::new(),
        }
    }

    pub fn route(
        &self,
        request: &CanonicalRequest,
        config: &Config,
        custom_router: Option<&dyn CustomRouter>,
    ) -> Result<RouteResult, AppError> {
        route(request, config, custom_router)
    }
}
