//! Credential store (spec §4.5) and the Copilot-style OAuth device-code flow.
//!
//! The store is a single JSON document mapping provider id -> `Credential`,
//! guarded by one `parking_lot::Mutex` that covers both the in-memory map
//! and the file write, so concurrent callers always observe a consistent
//! view (spec §5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default OAuth device-flow client id used for GitHub Copilot, overridable
/// via provider metadata (spec §4.5).
pub const DEFAULT_COPILOT_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

const REFRESH_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    ApiKey,
    BearerToken,
    Oauth,
    Basic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthTuple {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub kind: CredentialKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthTuple>,
}

impl Credential {
    pub fn api_key(provider: impl Into<String>, key: impl Into<String>) -> Self {
        Credential {
            provider: provider.into(),
            kind: CredentialKind::ApiKey,
            secret: Some(key.into()),
            oauth: None,
        }
    }

    /// Whether an oauth credential is within `REFRESH_SKEW_MS` of expiry.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        match &self.oauth {
            Some(o) => o
                .expires_at
                .map(|exp| exp - now_ms < REFRESH_SKEW_MS)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// On-disk JSON document: provider id -> credential.
type CredentialMap = HashMap<String, Credential>;

pub struct CredentialStore {
    path: PathBuf,
    inner: Mutex<CredentialMap>,
}

impl CredentialStore {
    /// Load (or initialize empty) the store at `path`, expanding `~`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading credential store {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing credential store {}", path.display()))?
        } else {
            CredentialMap::new()
        };
        Ok(CredentialStore {
            path,
            inner: Mutex::new(map),
        })
    }

    pub fn get(&self, provider: &str) -> Option<Credential> {
        self.inner.lock().get(provider).cloned()
    }

    pub fn list(&self) -> Vec<Credential> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn set(&self, credential: Credential) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.insert(credential.provider.clone(), credential);
        Self::write_locked(&self.path, &guard)
    }

    pub fn delete(&self, provider: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.remove(provider);
        Self::write_locked(&self.path, &guard)
    }

    fn write_locked(path: &Path, map: &CredentialMap) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating credential directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(map)?;
        std::fs::write(path, content)
            .with_context(|| format!("writing credential store {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }
        Ok(())
    }

    /// Default store path: `~/.ucr/credentials.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ucr")
            .join("credentials.json")
    }
}

// ---------------------------------------------------------------------------
// OAuth device-code flow
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenPollResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Outcome of a single poll against the token endpoint.
pub enum PollOutcome {
    Pending { retry_after: Duration },
    Success(Credential),
}

pub struct DeviceCodeFlow {
    client: reqwest::Client,
    device_code_url: String,
    token_url: String,
    client_id: String,
    provider: String,
}

impl DeviceCodeFlow {
    pub fn new(
        client: reqwest::Client,
        device_code_url: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        DeviceCodeFlow {
            client,
            device_code_url: device_code_url.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            provider: provider.into(),
        }
    }

    /// Step 1: request a device code. Caller is responsible for presenting
    /// `verification_uri`/`user_code` to the human (an external front-end).
    pub async fn start(&self, scope: Option<&str>) -> Result<DeviceCodeResponse> {
        let mut form = vec![("client_id", self.client_id.as_str())];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }
        let resp = self
            .client
            .post(&self.device_code_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("device code request failed")?;
        let resp = resp.error_for_status().context("device code endpoint error")?;
        resp.json().await.context("parsing device code response")
    }

    /// Step 3: poll the token endpoint once. Returns `Pending` on
    /// `authorization_pending`/`slow_down`; errors on any other `error`
    /// field; `Success` once `access_token` is present.
    pub async fn poll_once(
        &self,
        device_code: &str,
        current_interval: Duration,
    ) -> Result<PollOutcome> {
        let resp: TokenPollResponse = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", device_code),
                (
                    "grant_type",
                    "urn:ietf:params:oauth:grant-type:device_code",
                ),
            ])
            .send()
            .await
            .context("token poll request failed")?
            .json()
            .await
            .context("parsing token poll response")?;

        if let Some(access_token) = resp.access_token {
            let now = chrono::Utc::now().timestamp_millis();
            let credential = Credential {
                provider: self.provider.clone(),
                kind: CredentialKind::Oauth,
                secret: None,
                oauth: Some(OAuthTuple {
                    access_token,
                    refresh_token: resp.refresh_token,
                    expires_at: resp.expires_in.map(|secs| now + secs * 1000),
                    metadata: Default::default(),
                }),
            };
            return Ok(PollOutcome::Success(credential));
        }

        match resp.error.as_deref() {
            Some("authorization_pending") => Ok(PollOutcome::Pending {
                retry_after: current_interval,
            }),
            Some("slow_down") => Ok(PollOutcome::Pending {
                retry_after: current_interval + Duration::from_secs(5),
            }),
            Some(other) => Err(anyhow::anyhow!("device authorization failed: {other}")),
            None => Err(anyhow::anyhow!(
                "device authorization response had neither access_token nor error"
            )),
        }
    }

    /// Step 5: refresh an expiring oauth credential.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let resp: TokenPollResponse = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .context("refresh request failed")?
            .json()
            .await
            .context("parsing refresh response")?;

        let access_token = resp
            .access_token
            .ok_or_else(|| anyhow::anyhow!("refresh response missing access_token"))?;
        let now = chrono::Utc::now().timestamp_millis();
        Ok(Credential {
            provider: self.provider.clone(),
            kind: CredentialKind::Oauth,
            secret: None,
            oauth: Some(OAuthTuple {
                access_token,
                refresh_token: resp.refresh_token.or_else(|| Some(refresh_token.to_string())),
                expires_at: resp.expires_in.map(|secs| now + secs * 1000),
                metadata: Default::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_round_trip_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(&path).unwrap();
        assert!(store.get("anthropic").is_none());

        store
            .set(Credential::api_key("anthropic", "sk-abc"))
            .unwrap();

        // Reload from disk: same data.
        let reloaded = CredentialStore::load(&path).unwrap();
        let cred = reloaded.get("anthropic").unwrap();
        assert_eq!(cred.secret.as_deref(), Some("sk-abc"));

        reloaded.delete("anthropic").unwrap();
        let reloaded2 = CredentialStore::load(&path).unwrap();
        assert!(reloaded2.list().is_empty());
    }

    #[test]
    fn needs_refresh_within_skew() {
        let now = chrono::Utc::now().timestamp_millis();
        let cred = Credential {
            provider: "copilot".into(),
            kind: CredentialKind::Oauth,
            secret: None,
            oauth: Some(OAuthTuple {
                access_token: "t".into(),
                refresh_token: None,
                expires_at: Some(now + 60_000),
                metadata: Default::default(),
            }),
        };
        assert!(cred.needs_refresh(now));
    }

    #[test]
    fn does_not_need_refresh_when_far_from_expiry() {
        let now = chrono::Utc::now().timestamp_millis();
        let cred = Credential {
            provider: "copilot".into(),
            kind: CredentialKind::Oauth,
            secret: None,
            oauth: Some(OAuthTuple {
                access_token: "t".into(),
                refresh_token: None,
                expires_at: Some(now + 60 * 60 * 1000),
                metadata: Default::default(),
            }),
        };
        assert!(!cred.needs_refresh(now));
    }

    #[test]
    fn api_key_credential_never_needs_refresh() {
        let cred = Credential::api_key("anthropic", "sk-abc");
        assert!(!cred.needs_refresh(chrono::Utc::now().timestamp_millis()));
    }
}
