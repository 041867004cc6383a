//! Authentication state and the Device Code Flow login.
//!
//! `validate` is idempotent and serialized through a lock; concurrent
//! callers observe the same populated state on return.

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use crate::constants::{ClientInfo, CLIENT_ANDROID_APP, COOKIES_PATH};
use crate::error::{MinerError, Result};
use crate::http::HttpClient;
use crate::ui::Ui;
use crate::utils::{create_nonce, json_load, json_save, CHARS_HEX_LOWER};

const DEVICE_URL: &str = "https://id.twitch.tv/oauth2/device";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

const OAUTH_SCOPES: &str =
    "channel_read chat:read user_blocks_edit user_blocks_read user_follows_edit user_read";

// =============================================================================
// Cookie persistence
// =============================================================================

/// The cookie values worth keeping between runs, persisted on every
/// successful login and loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieJar {
    #[serde(rename = "unique_id", default)]
    pub unique_id: Option<String>,
    #[serde(rename = "auth-token", default)]
    pub auth_token: Option<String>,
}

impl CookieJar {
    pub fn load(path: impl AsRef<Path>) -> Self {
        json_load(path, Self::default())
    }

    pub fn save(&self, path: impl AsRef<Path>) {
        if let Err(e) = json_save(path, self) {
            tracing::warn!("Failed to persist cookies: {e}");
        }
    }
}

// =============================================================================
// Auth state
// =============================================================================

#[derive(Debug, Clone, Default)]
struct AuthData {
    user_id: Option<u64>,
    login: Option<String>,
    device_id: Option<String>,
    session_id: Option<String>,
    access_token: Option<String>,
}

/// Holds the session credentials and drives their lifecycle.
pub struct AuthState {
    client_info: ClientInfo,
    cookies_path: std::path::PathBuf,
    data: RwLock<AuthData>,
    validation_lock: Mutex<()>,
    logged_in: watch::Sender<bool>,
}

/// Fields that `invalidate` can drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Invalidate {
    pub auth: bool,
}

impl AuthState {
    pub fn new() -> Self {
        let (logged_in, _rx) = watch::channel(false);
        Self {
            client_info: CLIENT_ANDROID_APP,
            cookies_path: COOKIES_PATH.into(),
            data: RwLock::new(AuthData::default()),
            validation_lock: Mutex::new(()),
            logged_in,
        }
    }

    #[cfg(test)]
    pub fn for_test(user_id: u64, login: &str, access_token: &str, device_id: &str) -> Self {
        let state = Self::new();
        {
            let mut data = state.data.write().unwrap();
            data.user_id = Some(user_id);
            data.login = Some(login.to_string());
            data.access_token = Some(access_token.to_string());
            data.device_id = Some(device_id.to_string());
            data.session_id = Some("0123456789abcdef".to_string());
        }
        state
    }

    pub fn user_id(&self) -> Option<u64> {
        self.data.read().ok().and_then(|d| d.user_id)
    }

    pub fn login(&self) -> Option<String> {
        self.data.read().ok().and_then(|d| d.login.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.data.read().ok().and_then(|d| d.access_token.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        *self.logged_in.borrow()
    }

    /// Resolves once validation has completed at least once.
    pub async fn wait_until_login(&self) {
        let mut rx = self.logged_in.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop the named credentials, forcing re-validation on the next call.
    pub fn invalidate(&self, what: Invalidate) {
        if what.auth {
            if let Ok(mut data) = self.data.write() {
                data.access_token = None;
            }
        }
    }

    /// Drop everything and reset the logged-in event.
    pub fn clear(&self) {
        if let Ok(mut data) = self.data.write() {
            *data = AuthData::default();
        }
        self.logged_in.send_replace(false);
    }

    /// Headers for a GraphQL request, built from the current snapshot.
    pub fn gql_headers(&self) -> HeaderMap {
        let data = self.data.read().map(|d| d.clone()).unwrap_or_default();
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        headers.insert("Accept-Encoding", HeaderValue::from_static("gzip"));
        headers.insert("Accept-Language", HeaderValue::from_static("en-US"));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(self.client_info.client_id) {
            headers.insert("Client-Id", value);
        }
        if let Ok(value) = HeaderValue::from_str(self.client_info.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(self.client_info.client_url) {
            headers.insert("Origin", value.clone());
            headers.insert("Referer", value);
        }
        if let Some(session_id) = &data.session_id {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert("Client-Session-Id", value);
            }
        }
        if let Some(device_id) = &data.device_id {
            if let Ok(value) = HeaderValue::from_str(device_id) {
                headers.insert("X-Device-Id", value);
            }
        }
        if let Some(token) = &data.access_token {
            if let Ok(value) = HeaderValue::from_str(&format!("OAuth {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
            let cookie = format!(
                "unique_id={}; auth-token={}",
                data.device_id.as_deref().unwrap_or_default(),
                token
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert("Cookie", value);
            }
        }
        headers
    }

    fn oauth_headers(&self, device_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Accept-Encoding", HeaderValue::from_static("gzip"));
        headers.insert("Accept-Language", HeaderValue::from_static("en-US"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));
        if let Ok(value) = HeaderValue::from_str(self.client_info.client_id) {
            headers.insert("Client-Id", value);
        }
        if let Ok(value) = HeaderValue::from_str(self.client_info.client_url) {
            headers.insert("Origin", value.clone());
            headers.insert("Referer", value);
        }
        if let Ok(value) = HeaderValue::from_str(self.client_info.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(device_id) {
            headers.insert("X-Device-Id", value);
        }
        headers
    }

    /// Validate the session, populating any missing credentials.
    ///
    /// Idempotent; concurrent callers serialize on an internal lock and all
    /// observe the populated state on return.
    pub async fn validate(&self, http: &HttpClient, ui: &Ui) -> Result<()> {
        let _guard = self.validation_lock.lock().await;
        let mut jar = CookieJar::load(&self.cookies_path);

        // 1. session id: 16 lowercase hex chars, generated once
        if self.data.read().map(|d| d.session_id.is_none()).unwrap_or(true) {
            let session_id = create_nonce(CHARS_HEX_LOWER, 16);
            if let Ok(mut data) = self.data.write() {
                data.session_id = Some(session_id);
            }
        }

        // 2. device id: the platform's "unique_id" cookie
        if self.data.read().map(|d| d.device_id.is_none()).unwrap_or(true) {
            let device_id = match jar.unique_id.clone() {
                Some(unique_id) => unique_id,
                None => {
                    let fetched = self.fetch_unique_id(http).await?;
                    jar.unique_id = Some(fetched.clone());
                    fetched
                }
            };
            if let Ok(mut data) = self.data.write() {
                data.device_id = Some(device_id);
            }
        }
        let device_id = self
            .data
            .read()
            .ok()
            .and_then(|d| d.device_id.clone())
            .unwrap_or_default();

        // 3+4. access token and user id
        let needs_token = self
            .data
            .read()
            .map(|d| d.access_token.is_none() || d.user_id.is_none())
            .unwrap_or(true);
        if needs_token {
            ui.login_update("logging in");
            let mut validated = None;
            for _attempt in 0..2 {
                let access_token = match jar.auth_token.clone() {
                    Some(token) => {
                        tracing::info!("Restoring session from cookie");
                        token
                    }
                    None => {
                        let token = self.oauth_login(http, ui, &device_id).await?;
                        jar.auth_token = Some(token.clone());
                        token
                    }
                };
                match self.validate_token(http, &access_token).await? {
                    Some(response) => {
                        validated = Some((access_token, response));
                        break;
                    }
                    None => {
                        // 401: the restored token is invalid, clear and re-auth
                        tracing::info!("Restored session is invalid");
                        jar.auth_token = None;
                    }
                }
            }
            let Some((access_token, response)) = validated else {
                return Err(MinerError::Login("login verification failure".into()));
            };
            if response.client_id != self.client_info.client_id {
                return Err(MinerError::miner(
                    "cookie file belongs to a different client, please log in again",
                ));
            }
            let user_id: u64 = response
                .user_id
                .parse()
                .map_err(|_| MinerError::Login("invalid user id in validate response".into()))?;
            if let Ok(mut data) = self.data.write() {
                data.access_token = Some(access_token.clone());
                data.user_id = Some(user_id);
                data.login = Some(response.login.clone());
            }
            jar.auth_token = Some(access_token);
            jar.save(&self.cookies_path);
            tracing::info!("Login successful, user ID: {user_id}");
            ui.login_update(&format!("logged in as {}", response.login));
        }

        self.logged_in.send_replace(true);
        Ok(())
    }

    /// Fetch the platform's home URL and read the `unique_id` cookie.
    async fn fetch_unique_id(&self, http: &HttpClient) -> Result<String> {
        let response = http
            .execute(
                http.raw()
                    .get(self.client_info.client_url)
                    .header(USER_AGENT, self.client_info.user_agent)
                    .header("Accept", "text/html,application/xhtml+xml"),
                None,
            )
            .await?;
        for (name, value) in response.headers() {
            if !name.as_str().eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            let Ok(cookie_str) = value.to_str() else {
                continue;
            };
            if let Some(stripped) = cookie_str.strip_prefix("unique_id=") {
                let end = stripped.find(';').unwrap_or(stripped.len());
                return Ok(stripped[..end].to_string());
            }
        }
        // no cookie in the response; a generated id works just as well
        tracing::warn!("Could not get unique_id cookie, generating a device id");
        Ok(create_nonce(CHARS_HEX_LOWER, 32))
    }

    /// Run the device-code OAuth flow until an access token comes back.
    async fn oauth_login(&self, http: &HttpClient, ui: &Ui, device_id: &str) -> Result<String> {
        let headers = self.oauth_headers(device_id);
        loop {
            let response = http
                .execute(
                    http.raw()
                        .post(DEVICE_URL)
                        .headers(headers.clone())
                        .form(&[
                            ("client_id", self.client_info.client_id),
                            ("scopes", OAUTH_SCOPES),
                        ]),
                    None,
                )
                .await?;
            if !response.status().is_success() {
                return Err(MinerError::Login(format!(
                    "device code request failed: {}",
                    response.status()
                )));
            }
            let device: DeviceCodeResponse = response.json().await?;
            let expires_at = Utc::now() + chrono::Duration::seconds(device.expires_in as i64);

            ui.ask_enter_code(&device.user_code, &device.verification_uri);

            let poll = async {
                loop {
                    // sleep first, the user won't enter the code *that* fast
                    sleep(Duration::from_secs(device.interval)).await;
                    let response = http
                        .execute(
                            http.raw()
                                .post(TOKEN_URL)
                                .headers(headers.clone())
                                .form(&[
                                    ("client_id", self.client_info.client_id),
                                    ("device_code", device.device_code.as_str()),
                                    (
                                        "grant_type",
                                        "urn:ietf:params:oauth:grant-type:device_code",
                                    ),
                                ]),
                            Some(expires_at),
                        )
                        .await?;
                    // 200 means success, 400 means the user hasn't entered the code yet
                    if response.status().is_success() {
                        let token: TokenResponse = response.json().await?;
                        return Ok::<String, MinerError>(token.access_token);
                    }
                    if response.status().as_u16() != 400 {
                        return Err(MinerError::Login(format!(
                            "token request failed: {}",
                            response.status()
                        )));
                    }
                }
            };
            match poll.await {
                Ok(token) => return Ok(token),
                // the device code expired before the user authorized;
                // restart the flow with a fresh code
                Err(MinerError::RequestInvalid) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate a token. `Ok(None)` means 401 (token rejected).
    async fn validate_token(
        &self,
        http: &HttpClient,
        access_token: &str,
    ) -> Result<Option<ValidateResponse>> {
        let response = http
            .execute(
                http.raw()
                    .get(VALIDATE_URL)
                    .header(AUTHORIZATION, format!("OAuth {access_token}")),
                None,
            )
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json().await?)),
            401 => Ok(None),
            status => Err(MinerError::Login(format!("token validation failed: {status}"))),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Response from the device code request.
#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

/// Response from the token request.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Response from the validate endpoint.
#[derive(Debug, Deserialize)]
struct ValidateResponse {
    client_id: String,
    user_id: String,
    login: String,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gql_headers_contain_required_fields() {
        let auth = AuthState::for_test(
            12345678,
            "testuser",
            "test_token_12345",
            "abcdef1234567890abcdef1234567890",
        );
        let headers = auth.gql_headers();

        assert!(headers.contains_key("Client-Id"));
        assert!(headers.contains_key(USER_AGENT));
        assert!(headers.contains_key(AUTHORIZATION));
        assert!(headers.contains_key("X-Device-Id"));
        assert!(headers.contains_key("Client-Session-Id"));
        assert!(headers.contains_key("Origin"));
        assert!(headers.contains_key("Referer"));
        assert!(headers.contains_key("Cookie"));
    }

    #[test]
    fn test_authorization_header_format() {
        let auth = AuthState::for_test(1, "u", "tok123", "dev");
        let headers = auth.gql_headers();
        let value = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert_eq!(value, "OAuth tok123");
    }

    #[test]
    fn test_unvalidated_state_omits_auth_headers() {
        let auth = AuthState::new();
        let headers = auth.gql_headers();
        assert!(headers.contains_key("Client-Id"));
        assert!(!headers.contains_key(AUTHORIZATION));
        assert!(!headers.contains_key("Cookie"));
    }

    #[test]
    fn test_invalidate_drops_only_token() {
        let auth = AuthState::for_test(1, "u", "tok", "dev");
        auth.invalidate(Invalidate { auth: true });
        assert!(auth.access_token().is_none());
        assert_eq!(auth.user_id(), Some(1));
    }

    #[test]
    fn test_clear_resets_everything() {
        let auth = AuthState::for_test(1, "u", "tok", "dev");
        auth.logged_in.send_replace(true);
        auth.clear();
        assert!(auth.access_token().is_none());
        assert!(auth.user_id().is_none());
        assert!(!auth.is_logged_in());
    }

    #[test]
    fn test_cookie_jar_roundtrip() {
        let path = std::env::temp_dir().join("tdm_cookies_test.json");
        let jar = CookieJar {
            unique_id: Some("abc123".to_string()),
            auth_token: Some("tok456".to_string()),
        };
        jar.save(&path);
        let loaded = CookieJar::load(&path);
        assert_eq!(loaded.unique_id.as_deref(), Some("abc123"));
        assert_eq!(loaded.auth_token.as_deref(), Some("tok456"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_wait_until_login_wakes() {
        let auth = std::sync::Arc::new(AuthState::new());
        let waiter = auth.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_login().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        auth.logged_in.send_replace(true);
        assert!(handle.await.unwrap());
    }
}
