//! OAuth token broker: PKCE authorization, code exchange, opportunistic
//! refresh, and an atomic on-disk token store.
//!
//! The store is a single JSON object mapping provider id to [`OauthInfo`]
//! at `<data-root>/tether/auth.json`, mode 0600. All mutations go through
//! read-modify-write under a store-level lock; refreshes are additionally
//! serialized per provider so two callers observing expiry at once produce
//! at most one surviving token (the newer write wins, either is valid).
//! Token values are never logged.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::config;
use crate::csync;
use crate::util::now_ms;

pub const ANTHROPIC_PROVIDER_ID: &str = "anthropic";

const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";
const AUTH_FILENAME: &str = "auth.json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Which authorization surface to send the user to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Max,
    Console,
}

impl AuthMode {
    fn authorize_host(self) -> &'static str {
        match self {
            AuthMode::Max => "claude.ai",
            AuthMode::Console => "console.anthropic.com",
        }
    }
}

/// Stored OAuth material for one provider. Never logged.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OauthInfo {
    #[serde(rename = "type")]
    pub token_type: String,
    pub refresh: String,
    pub access: String,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub expires: i64,
}

impl OauthInfo {
    pub fn is_oauth(&self) -> bool {
        self.token_type == "oauth"
    }

    fn is_fresh(&self) -> bool {
        !self.access.is_empty() && self.expires > now_ms()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    refresh_token: String,
    access_token: String,
    expires_in: i64,
}

impl TokenResponse {
    fn into_info(self) -> OauthInfo {
        OauthInfo {
            token_type: "oauth".to_string(),
            refresh: self.refresh_token,
            access: self.access_token,
            expires: now_ms() + self.expires_in * 1000,
        }
    }
}

struct Pkce {
    verifier: String,
    challenge: String,
}

fn generate_pkce() -> Pkce {
    // 43-128 characters recommended; 64 random bytes base64url-encodes to 86.
    let mut buf = [0u8; 64];
    rand::rng().fill_bytes(&mut buf);
    let verifier = URL_SAFE_NO_PAD.encode(buf);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(digest);
    Pkce {
        verifier,
        challenge,
    }
}

/// Build the authorization URL; returns `(url, verifier)`. The verifier
/// doubles as the `state` parameter, which the callback echoes back in the
/// pasted `code#state` string.
pub fn authorize_url(mode: AuthMode) -> (String, String) {
    let pkce = generate_pkce();
    let url = format!(
        "https://{host}/oauth/authorize?code=true&client_id={client_id}&response_type=code&redirect_uri={redirect}&scope={scope}&code_challenge={challenge}&code_challenge_method=S256&state={state}",
        host = mode.authorize_host(),
        client_id = ANTHROPIC_CLIENT_ID,
        redirect = urlencode(REDIRECT_URI),
        scope = urlencode(OAUTH_SCOPES),
        challenge = pkce.challenge,
        state = pkce.verifier,
    );
    (url, pkce.verifier)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub struct TokenBroker {
    auth_path: PathBuf,
    token_url: String,
    http: reqwest::Client,
    /// Serializes same-process read-modify-write cycles on the store file.
    file_lock: Mutex<()>,
    /// Serializes refreshes per provider.
    refresh_locks: csync::LockMap<String>,
}

impl TokenBroker {
    /// Broker over the default store location under the platform data root.
    pub fn new() -> Self {
        Self::with_store_path(
            config::data_root()
                .join(config::APP_NAME)
                .join(AUTH_FILENAME),
        )
    }

    pub fn with_store_path(auth_path: PathBuf) -> Self {
        Self {
            auth_path,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            http: reqwest::Client::new(),
            file_lock: Mutex::new(()),
            refresh_locks: csync::LockMap::new(),
        }
    }

    /// Point the broker at a different token endpoint (tests).
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Exchange the pasted `code#state` string for tokens and persist them
    /// for the provider.
    pub async fn exchange_code(
        &self,
        provider_id: &str,
        code_with_state: &str,
        verifier: &str,
    ) -> Result<OauthInfo> {
        let mut parts = code_with_state.splitn(2, '#');
        let code = parts.next().unwrap_or_default();
        let state = parts
            .next()
            .ok_or_else(|| anyhow!("invalid code format, expected code#state"))?;

        let body = serde_json::json!({
            "code": code,
            "state": state,
            "grant_type": "authorization_code",
            "client_id": ANTHROPIC_CLIENT_ID,
            "redirect_uri": REDIRECT_URI,
            "code_verifier": verifier,
        });
        let response = self
            .http
            .post(&self.token_url)
            .timeout(HTTP_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("token exchange request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("exchange failed: {}", response.status()));
        }
        let info = response.json::<TokenResponse>().await?.into_info();
        self.set(provider_id, info.clone()).await?;
        Ok(info)
    }

    /// A currently valid access token for the provider, refreshing when the
    /// stored one has expired. Returns `Ok(None)` when the provider has no
    /// OAuth record.
    pub async fn access_token(&self, provider_id: &str) -> Result<Option<String>> {
        let Some(info) = self.get(provider_id).await? else {
            return Ok(None);
        };
        if !info.is_oauth() {
            return Ok(None);
        }
        if info.is_fresh() {
            return Ok(Some(info.access));
        }
        self.refresh(provider_id).await.map(Some)
    }

    /// Force a refresh regardless of stored expiry (used after a 401).
    ///
    /// Two callers observing expiry at once serialize on the provider lock
    /// and may both refresh; the newer stored token wins and either is a
    /// valid outcome.
    pub async fn refresh(&self, provider_id: &str) -> Result<String> {
        let lock = self.refresh_locks.lock_for(&provider_id.to_string());
        let _guard = lock.lock().await;

        let info = self
            .get(provider_id)
            .await?
            .filter(OauthInfo::is_oauth)
            .ok_or_else(|| anyhow!("no oauth record for provider {provider_id}"))?;

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": info.refresh,
            "client_id": ANTHROPIC_CLIENT_ID,
        });
        let response = self
            .http
            .post(&self.token_url)
            .timeout(HTTP_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("token refresh request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("refresh failed: {}", response.status()));
        }
        let updated = response.json::<TokenResponse>().await?.into_info();
        self.set(provider_id, updated.clone()).await?;
        Ok(updated.access)
    }

    pub async fn get(&self, provider_id: &str) -> Result<Option<OauthInfo>> {
        let _guard = self.file_lock.lock().await;
        Ok(self.read_all()?.remove(provider_id))
    }

    pub async fn set(&self, provider_id: &str, info: OauthInfo) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        let mut all = self.read_all()?;
        all.insert(provider_id.to_string(), info);
        self.write_all(&all)
    }

    pub async fn remove(&self, provider_id: &str) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        let mut all = self.read_all()?;
        all.remove(provider_id);
        self.write_all(&all)
    }

    fn read_all(&self) -> Result<HashMap<String, OauthInfo>> {
        let data = match std::fs::read(&self.auth_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        // A corrupt store is treated as empty rather than fatal.
        Ok(serde_json::from_slice(&data).unwrap_or_default())
    }

    fn write_all(&self, all: &HashMap<String, OauthInfo>) -> Result<()> {
        if let Some(parent) = self.auth_path.parent() {
            create_private_dir(parent)?;
        }
        let data = serde_json::to_vec_pretty(all)?;
        config::write_private(&self.auth_path, &data)?;
        Ok(())
    }
}

impl Default for TokenBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}
