//! Configuration document, load pipeline and hot-reload (spec §4.7).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::credentials::CredentialStore;

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token_threshold() -> u64 {
    100_000
}

fn default_priority() -> i32 {
    0
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Minimum idle connections to keep warm per upstream host (spec §4.6).
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// 0 = unlimited concurrent SSE streams.
    #[serde(default)]
    pub max_concurrent_streams: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            cors: true,
            rate_limit: None,
            timeout: default_timeout_ms(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            max_concurrent_streams: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub pretty: bool,
    #[serde(default)]
    pub requests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
            pretty: false,
            requests: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    ApiKey,
    BearerToken,
    Oauth,
    Basic,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub auth_type: Option<AuthKind>,
    /// Raw secret, populated at load time by env expansion or the
    /// credential store (spec §4.5). `None` for `authType: none`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<usize>,
    #[serde(default)]
    pub extra_headers: std::collections::HashMap<String, String>,
    /// Opaque per-provider metadata: Vertex project/location, Replicate
    /// model version, Copilot editor headers, etc.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Provider {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(30_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub default: String,
    #[serde(default)]
    pub think: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub long_context: Option<String>,
    #[serde(default)]
    pub web_search: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Path to an external routing script/executable implementing the
    /// `(request, {providers, taskType, tokenCount}) -> providerId`
    /// contract (spec §4.1). Invoked once at config-apply time and cached.
    #[serde(default)]
    pub custom_router: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerOverride {
    pub provider: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default)]
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesConfig {
    #[serde(default)]
    pub cost_tracking: bool,
    #[serde(default)]
    pub analytics: bool,
    #[serde(default = "default_true")]
    pub health_checks: bool,
    #[serde(default)]
    pub auto_discovery: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        FeaturesConfig {
            cost_tracking: false,
            analytics: false,
            health_checks: true,
            auto_discovery: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub providers: Vec<Provider>,
    pub router: RouterConfig,
    #[serde(default)]
    pub transformers: Vec<TransformerOverride>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

impl ConfigFile {
    fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("providers must not be empty");
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.as_str()) {
                bail!("duplicate provider id: {}", p.id);
            }
        }
        if self.router.default.is_empty() {
            bail!("router.default must name a provider id");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Env + credential-store expansion
// ---------------------------------------------------------------------------

const PLACEHOLDER_PREFIX: &str = "${";

fn placeholder_name(s: &str) -> Option<&str> {
    let s = s.trim();
    s.strip_prefix(PLACEHOLDER_PREFIX)
        .and_then(|rest| rest.strip_suffix('}'))
}

/// First pass (spec §4.7 step 2): replace `${NAME}` in string fields from
/// the process environment. Leaves the placeholder untouched when `NAME`
/// is undefined and `is_oauth` (the containing provider's authType) is set.
fn expand_env(value: &mut serde_json::Value, is_oauth: bool) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(name) = placeholder_name(s) {
                match std::env::var(name) {
                    Ok(resolved) => *s = resolved,
                    Err(_) if is_oauth => { /* left intact for step 3 */ }
                    Err(_) => { /* left for the second pass to report */ }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                expand_env(item, is_oauth);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                expand_env(v, is_oauth);
            }
        }
        _ => {}
    }
}

/// Second pass (spec §4.7 step 4): any surviving `${NAME}` is an error.
fn find_surviving_placeholder(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => placeholder_name(s).map(|n| n.to_string()),
        serde_json::Value::Array(items) => items.iter().find_map(find_surviving_placeholder),
        serde_json::Value::Object(map) => map.values().find_map(find_surviving_placeholder),
        _ => None,
    }
}

/// Load credentials for oauth providers whose apiKey placeholder survived
/// the env pass (spec §4.7 step 3).
fn substitute_oauth_credentials(
    raw: &mut serde_json::Value,
    store: &CredentialStore,
) -> Result<()> {
    let providers = raw
        .get_mut("providers")
        .and_then(|v| v.as_array_mut())
        .context("providers must be an array")?;

    for provider in providers {
        let is_oauth = provider.get("authType").and_then(|v| v.as_str()) == Some("oauth");
        if !is_oauth {
            continue;
        }
        let still_placeholder = provider
            .get("apiKey")
            .and_then(|v| v.as_str())
            .and_then(placeholder_name)
            .is_some();
        if !still_placeholder {
            continue;
        }
        let id = provider
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let credential = store.get(&id).ok_or_else(|| {
            anyhow::anyhow!(
                "no oauth credential stored for provider '{id}' — run `auth login {id}` first"
            )
        })?;
        let access_token = credential
            .oauth
            .as_ref()
            .map(|o| o.access_token.clone())
            .ok_or_else(|| anyhow::anyhow!("stored credential for '{id}' is not an oauth credential"))?;
        provider["apiKey"] = serde_json::Value::String(access_token);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Runtime config + snapshot
// ---------------------------------------------------------------------------

/// Runtime configuration shared across handlers, wrapping the validated
/// document plus the single pooled HTTP client (spec §4.6).
#[derive(Debug, Clone)]
pub struct Config {
    file: Arc<ConfigFile>,
    http_client: reqwest::Client,
}

impl Config {
    pub fn file(&self) -> &ConfigFile {
        &self.file
    }

    pub fn providers(&self) -> &[Provider] {
        &self.file.providers
    }

    pub fn router(&self) -> &RouterConfig {
        &self.file.router
    }

    pub fn server(&self) -> &ServerConfig {
        &self.file.server
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn enabled_providers_by_priority(&self) -> Vec<&Provider> {
        let mut providers: Vec<&Provider> = self.file.providers.iter().filter(|p| p.enabled).collect();
        providers.sort_by(|a, b| b.priority.cmp(&a.priority));
        providers
    }

    pub fn provider(&self, id: &str) -> Option<&Provider> {
        self.file.providers.iter().find(|p| p.id == id)
    }

    /// Build a `Config` from an already-validated, already-expanded
    /// document (spec §4.7 step 6: apply). `pub(crate)` so other modules'
    /// tests can build a `Config` directly without a config file on disk.
    pub(crate) fn from_file(file: ConfigFile) -> Result<Self> {
        file.validate()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(file.server.timeout))
            .pool_max_idle_per_host(file.server.pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .context("building shared HTTP client")?;

        Ok(Config {
            file: Arc::new(file),
            http_client: client,
        })
    }
}

/// Runs the full load pipeline of spec §4.7 against the file at `path`.
pub fn load(path: impl AsRef<Path>, store: &CredentialStore) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut raw: serde_json::Value =
        serde_json::from_str(&content).context("parsing config JSON")?;

    // Step 2: env expansion, oauth carve-out per provider.
    if let Some(providers) = raw.get_mut("providers").and_then(|v| v.as_array_mut()) {
        for provider in providers {
            let is_oauth = provider.get("authType").and_then(|v| v.as_str()) == Some("oauth");
            expand_env(provider, is_oauth);
        }
    }
    if let Some(server) = raw.get_mut("server") {
        expand_env(server, false);
    }

    // Step 3: oauth credential substitution.
    substitute_oauth_credentials(&mut raw, store)?;

    // Step 4: any surviving placeholder is fatal.
    if let Some(name) = find_surviving_placeholder(&raw) {
        bail!("unresolved config placeholder \"${{{name}}}\" — set the environment variable or run the provider's auth login step");
    }

    // Step 5: schema validation (typed deserialize does most of the work).
    let file: ConfigFile = serde_json::from_value(raw).context("config failed schema validation")?;

    // Step 6: apply.
    Config::from_file(file)
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Holds the currently-published snapshot; readers never lock beyond a
/// cheap `Arc` clone (spec §5).
pub struct ConfigManager {
    current: RwLock<Config>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(initial: Config, path: PathBuf) -> Arc<Self> {
        Arc::new(ConfigManager {
            current: RwLock::new(initial),
            path,
        })
    }

    pub fn current(&self) -> Config {
        self.current.read().clone()
    }

    /// Re-runs the load pipeline and publishes on success. On failure the
    /// previous snapshot stays in force (spec §4.7).
    pub fn reload(&self, store: &CredentialStore) -> Result<()> {
        match load(&self.path, store) {
            Ok(new_config) => {
                *self.current.write() = new_config;
                tracing::info!(path = %self.path.display(), "config reloaded");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "config reload failed, keeping previous snapshot");
                Err(err)
            }
        }
    }

    /// Spawns a debounced filesystem watcher (500ms-1s coalescing window)
    /// that reloads on change.
    pub fn watch(self: &Arc<Self>, store: Arc<CredentialStore>) -> Result<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Wait for the first event, then coalesce anything that
                // arrives in the debounce window.
                if rx.recv().await.is_none() {
                    break;
                }
                loop {
                    match tokio::time::timeout(Duration::from_millis(750), rx.recv()).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                let _ = manager.reload(&store);
            }
        });

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn minimal_config() -> &'static str {
        r#"{
            "providers": [
                {"id": "anthropic", "name": "Anthropic", "baseUrl": "https://api.anthropic.com", "apiKey": "k", "priority": 10}
            ],
            "router": {"default": "anthropic"}
        }"#
    }

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_config());
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        let config = load(&path, &store).unwrap();
        assert_eq!(config.providers().len(), 1);
        assert_eq!(config.router().default, "anthropic");
    }

    #[test]
    fn env_placeholder_expands() {
        std::env::set_var("UCR_TEST_KEY", "sk-from-env");
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "providers": [
                {"id": "anthropic", "name": "Anthropic", "baseUrl": "https://api.anthropic.com", "apiKey": "${UCR_TEST_KEY}", "priority": 10}
            ],
            "router": {"default": "anthropic"}
        }"#;
        let path = write_config(&dir, body);
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        let config = load(&path, &store).unwrap();
        assert_eq!(config.provider("anthropic").unwrap().api_key.as_deref(), Some("sk-from-env"));
    }

    #[test]
    fn missing_env_var_is_fatal_for_non_oauth() {
        std::env::remove_var("UCR_TEST_MISSING_ABSOLUTELY");
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "providers": [
                {"id": "anthropic", "name": "Anthropic", "baseUrl": "https://api.anthropic.com", "apiKey": "${UCR_TEST_MISSING_ABSOLUTELY}", "priority": 10}
            ],
            "router": {"default": "anthropic"}
        }"#;
        let path = write_config(&dir, body);
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        assert!(load(&path, &store).is_err());
    }

    #[test]
    fn oauth_placeholder_resolves_from_credential_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        store
            .set(crate::credentials::Credential {
                provider: "copilot".into(),
                kind: crate::credentials::CredentialKind::Oauth,
                secret: None,
                oauth: Some(crate::credentials::OAuthTuple {
                    access_token: "gho_abc".into(),
                    refresh_token: None,
                    expires_at: None,
                    metadata: Default::default(),
                }),
            })
            .unwrap();

        let body = r#"{
            "providers": [
                {"id": "copilot", "name": "Copilot", "baseUrl": "https://api.githubcopilot.com", "authType": "oauth", "apiKey": "${COPILOT_TOKEN_UNSET}", "priority": 10}
            ],
            "router": {"default": "copilot"}
        }"#;
        let path = write_config(&dir, body);
        let config = load(&path, &store).unwrap();
        assert_eq!(
            config.provider("copilot").unwrap().api_key.as_deref(),
            Some("gho_abc")
        );
    }

    #[test]
    fn oauth_without_stored_credential_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        let body = r#"{
            "providers": [
                {"id": "copilot", "name": "Copilot", "baseUrl": "https://api.githubcopilot.com", "authType": "oauth", "apiKey": "${COPILOT_TOKEN_UNSET}", "priority": 10}
            ],
            "router": {"default": "copilot"}
        }"#;
        let path = write_config(&dir, body);
        let err = load(&path, &store).unwrap_err();
        assert!(err.to_string().contains("auth login"));
    }

    #[test]
    fn duplicate_provider_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "providers": [
                {"id": "anthropic", "name": "A", "baseUrl": "https://a", "apiKey": "k", "priority": 1},
                {"id": "anthropic", "name": "B", "baseUrl": "https://b", "apiKey": "k", "priority": 2}
            ],
            "router": {"default": "anthropic"}
        }"#;
        let path = write_config(&dir, body);
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        assert!(load(&path, &store).is_err());
    }

    #[test]
    fn enabled_providers_sorted_by_priority_descending() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "providers": [
                {"id": "low", "name": "L", "baseUrl": "https://l", "apiKey": "k", "priority": 1},
                {"id": "high", "name": "H", "baseUrl": "https://h", "apiKey": "k", "priority": 99},
                {"id": "disabled", "name": "D", "baseUrl": "https://d", "apiKey": "k", "priority": 1000, "enabled": false}
            ],
            "router": {"default": "low"}
        }"#;
        let path = write_config(&dir, body);
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        let config = load(&path, &store).unwrap();
        let ids: Vec<&str> = config
            .enabled_providers_by_priority()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_config());
        let store = CredentialStore::load(dir.path().join("credentials.json")).unwrap();
        let config = load(&path, &store).unwrap();
        let manager = ConfigManager::new(config, path.clone());

        // Corrupt the file.
        std::fs::write(&path, "{not json").unwrap();
        assert!(manager.reload(&store).is_err());

        // Previous snapshot is still in force.
        assert_eq!(manager.current().providers().len(), 1);
    }
}
