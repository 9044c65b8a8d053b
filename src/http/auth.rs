//! Access-token acquisition for the transport
//!
//! Four token sources are supported, selected by the first configured
//! option: an OAuth2 refresh token, a service-account JSON key file, the
//! GCE metadata server, and a LUCI local auth context. All of them speak
//! HTTP through this crate's own client pointed at the token endpoint.
//!
//! Tokens are cached per client and refreshed by a single flight;
//! transactions that need a token while a refresh is running wait on a
//! condvar until it completes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::{HttpClient, HttpResponse, Options, Status};

/// Margin before expiry at which a token counts as stale.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint error: {0}")]
    Endpoint(String),

    #[error("cannot parse token response: {0}")]
    Parse(String),

    #[error("cannot read service account key: {0}")]
    KeyFile(String),

    #[error("service account signing requires an assertion signer")]
    SignerNotConfigured,
}

/// OAuth2 refresh-token configuration.
#[derive(Debug, Clone, Default)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_uri: String,
    pub scopes: Vec<String>,
}

impl OAuth2Config {
    pub fn enabled(&self) -> bool {
        !self.refresh_token.is_empty() && !self.token_uri.is_empty()
    }
}

/// LUCI local auth context (as found in LUCI_CONTEXT files).
#[derive(Debug, Clone, Default)]
pub struct LuciContextAuth {
    pub rpc_port: u16,
    pub secret: String,
    pub account_id: String,
}

impl LuciContextAuth {
    pub fn enabled(&self) -> bool {
        self.rpc_port != 0 && !self.secret.is_empty()
    }
}

/// A parsed service-account key file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub token_uri: String,
    #[serde(default)]
    pub private_key: String,
}

/// Produces the signed JWT assertion for the service-account grant. RS256
/// signing is the embedder's concern; this crate only drives the exchange.
pub trait AssertionSigner: Send + Sync {
    fn assertion(&self, key: &ServiceAccountKey, scopes: &[String]) -> Result<String, AuthError>;
}

/// Which auth source the options select.
#[derive(Debug, Clone)]
pub enum AuthSource {
    OAuth2RefreshToken(OAuth2Config),
    ServiceAccountJson(PathBuf),
    GceServiceAccount(String),
    LuciContext(LuciContextAuth),
}

/// First configured source wins; `None` means unauthenticated.
pub fn select_auth_source(options: &Options) -> Option<AuthSource> {
    if options.oauth2_config.enabled() {
        return Some(AuthSource::OAuth2RefreshToken(options.oauth2_config.clone()));
    }
    if !options.service_account_json_filename.is_empty() {
        return Some(AuthSource::ServiceAccountJson(PathBuf::from(
            &options.service_account_json_filename,
        )));
    }
    if !options.gce_service_account.is_empty() {
        return Some(AuthSource::GceServiceAccount(
            options.gce_service_account.clone(),
        ));
    }
    if options.luci_context_auth.enabled() {
        return Some(AuthSource::LuciContext(options.luci_context_auth.clone()));
    }
    None
}

/// A bearer token with its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token should be refreshed before use.
    pub fn stale(&self) -> bool {
        let margin = chrono::Duration::from_std(TOKEN_REFRESH_MARGIN)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() + margin >= self.expires_at
    }
}

/// Fetches a fresh token from the configured source.
pub trait TokenSupplier: Send + Sync {
    fn fetch(&self) -> Result<AccessToken, AuthError>;
}

struct RefreshState {
    token: Option<AccessToken>,
    refreshing: bool,
}

/// Token cache with single-flight refresh.
pub struct TokenRefreshTask {
    supplier: Box<dyn TokenSupplier>,
    state: Mutex<RefreshState>,
    cond: Condvar,
}

impl TokenRefreshTask {
    pub fn new(supplier: Box<dyn TokenSupplier>) -> Self {
        Self {
            supplier,
            state: Mutex::new(RefreshState {
                token: None,
                refreshing: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Build the refresh task for the configured auth source, if any.
    pub(crate) fn from_options(options: &Options) -> Option<Self> {
        let supplier: Box<dyn TokenSupplier> = match select_auth_source(options)? {
            AuthSource::OAuth2RefreshToken(config) => Box::new(RefreshTokenSupplier { config }),
            AuthSource::ServiceAccountJson(path) => Box::new(ServiceAccountSupplier {
                path,
                scopes: options.oauth2_config.scopes.clone(),
                signer: options.assertion_signer.clone(),
            }),
            AuthSource::GceServiceAccount(account) => Box::new(GceMetadataSupplier { account }),
            AuthSource::LuciContext(auth) => Box::new(LuciContextSupplier {
                auth,
                scopes: options.oauth2_config.scopes.clone(),
            }),
        };
        Some(Self::new(supplier))
    }

    /// The `Authorization` header value, refreshing the cached token if it
    /// is missing or stale. Concurrent callers share one refresh.
    pub fn authorization(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(token) = &state.token {
                if !token.stale() {
                    return Ok(format!("Bearer {}", token.token));
                }
            }
            if state.refreshing {
                state = self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            state.refreshing = true;
            drop(state);

            debug!("refreshing access token");
            let result = self.supplier.fetch();

            state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.refreshing = false;
            self.cond.notify_all();
            match result {
                Ok(token) => {
                    state.token = Some(token);
                }
                Err(e) => {
                    warn!(error = %e, "access token refresh failed");
                    state.token = None;
                    return Err(e);
                }
            }
        }
    }

    /// Drop the cached token; the next transaction refreshes. Called on
    /// 401/403 responses.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.token = None;
    }

    /// Whether a usable token is currently cached.
    pub fn has_token(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .as_ref()
            .map(|t| !t.stale())
            .unwrap_or(false)
    }
}

// === Wire helpers shared by the HTTP-backed suppliers ===

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    /// LUCI reports an absolute unix expiry instead.
    #[serde(default)]
    expiry: Option<i64>,
}

fn token_from_response(bytes: &[u8]) -> Result<AccessToken, AuthError> {
    let parsed: TokenResponse =
        serde_json::from_slice(bytes).map_err(|e| AuthError::Parse(e.to_string()))?;
    let expires_at = if let Some(expiry) = parsed.expiry {
        DateTime::<Utc>::from_timestamp(expiry, 0)
            .ok_or_else(|| AuthError::Parse(format!("bad expiry {}", expiry)))?
    } else {
        Utc::now() + chrono::Duration::seconds(parsed.expires_in.unwrap_or(3600))
    };
    Ok(AccessToken {
        token: parsed.access_token,
        expires_at,
    })
}

/// Percent-encode a form value.
fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn form_body(fields: &[(&str, &str)]) -> Vec<u8> {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", key, form_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
        .into_bytes()
}

/// One-shot HTTP exchange against a token endpoint, using a private
/// unauthenticated client.
fn http_exchange(
    url: &str,
    method: &str,
    content_type: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<Vec<u8>, AuthError> {
    let mut options = Options::default();
    if !options.init_from_url(url) {
        return Err(AuthError::Endpoint(format!("bad token endpoint {:?}", url)));
    }
    options.num_worker_threads = 1;
    let client =
        HttpClient::new(options).map_err(|e| AuthError::Endpoint(format!("client: {}", e)))?;

    let mut req = client.init_request(method, "");
    if let Some(content_type) = content_type {
        req.set_content_type(content_type);
    }
    for (key, value) in headers {
        req.add_header(*key, *value);
    }
    if let Some(body) = body {
        req.set_body(body);
    }

    let resp = Arc::new(Mutex::new(HttpResponse::new_parsed()));
    let status = Arc::new(Mutex::new(Status {
        timeouts: VecDeque::from([Duration::from_secs(10), Duration::from_secs(10)]),
        ..Status::new()
    }));
    client.do_sync(req, &resp, &status);

    let status = status.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(err) = &status.err {
        return Err(AuthError::Endpoint(format!("{}", err)));
    }
    let resp = resp.lock().unwrap_or_else(PoisonError::into_inner);
    if !(200..300).contains(&resp.status_code()) {
        return Err(AuthError::Endpoint(format!(
            "token endpoint returned {}",
            resp.status_code()
        )));
    }
    Ok(resp.parsed_body().to_vec())
}

/// OAuth2 refresh-token grant.
struct RefreshTokenSupplier {
    config: OAuth2Config,
}

impl TokenSupplier for RefreshTokenSupplier {
    fn fetch(&self) -> Result<AccessToken, AuthError> {
        let body = form_body(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", self.config.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ]);
        let bytes = http_exchange(
            &self.config.token_uri,
            "POST",
            Some("application/x-www-form-urlencoded"),
            &[],
            Some(body),
        )?;
        token_from_response(&bytes)
    }
}

/// Service-account JWT-bearer grant; the signer produces the assertion.
struct ServiceAccountSupplier {
    path: PathBuf,
    scopes: Vec<String>,
    signer: Option<Arc<dyn AssertionSigner>>,
}

impl TokenSupplier for ServiceAccountSupplier {
    fn fetch(&self) -> Result<AccessToken, AuthError> {
        let bytes = std::fs::read(&self.path).map_err(|e| AuthError::KeyFile(e.to_string()))?;
        let key: ServiceAccountKey =
            serde_json::from_slice(&bytes).map_err(|e| AuthError::KeyFile(e.to_string()))?;
        let signer = self.signer.as_ref().ok_or(AuthError::SignerNotConfigured)?;
        let assertion = signer.assertion(&key, &self.scopes)?;

        let body = form_body(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ]);
        let bytes = http_exchange(
            &key.token_uri,
            "POST",
            Some("application/x-www-form-urlencoded"),
            &[],
            Some(body),
        )?;
        token_from_response(&bytes)
    }
}

/// GCE metadata-server token for the given service account.
struct GceMetadataSupplier {
    account: String,
}

impl TokenSupplier for GceMetadataSupplier {
    fn fetch(&self) -> Result<AccessToken, AuthError> {
        let url = format!(
            "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/{}/token",
            self.account
        );
        let bytes = http_exchange(&url, "GET", None, &[("Metadata-Flavor", "Google")], None)?;
        token_from_response(&bytes)
    }
}

/// LUCI local auth RPC.
struct LuciContextSupplier {
    auth: LuciContextAuth,
    scopes: Vec<String>,
}

impl TokenSupplier for LuciContextSupplier {
    fn fetch(&self) -> Result<AccessToken, AuthError> {
        let url = format!(
            "http://127.0.0.1:{}/rpc/LuciLocalAuthService.GetOAuthToken",
            self.auth.rpc_port
        );
        let body = serde_json::json!({
            "scopes": self.scopes,
            "secret": self.auth.secret,
            "account_id": self.auth.account_id,
        });
        let bytes = http_exchange(
            &url,
            "POST",
            Some("application/json"),
            &[],
            Some(body.to_string().into_bytes()),
        )?;
        token_from_response(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_select_auth_source_order() {
        let mut options = Options::default();
        assert!(select_auth_source(&options).is_none());

        options.luci_context_auth = LuciContextAuth {
            rpc_port: 8200,
            secret: "s".to_string(),
            account_id: "a".to_string(),
        };
        assert!(matches!(
            select_auth_source(&options),
            Some(AuthSource::LuciContext(_))
        ));

        options.gce_service_account = "default".to_string();
        assert!(matches!(
            select_auth_source(&options),
            Some(AuthSource::GceServiceAccount(_))
        ));

        options.service_account_json_filename = "/sa.json".to_string();
        assert!(matches!(
            select_auth_source(&options),
            Some(AuthSource::ServiceAccountJson(_))
        ));

        options.oauth2_config = OAuth2Config {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "rt".to_string(),
            token_uri: "https://oauth2.example.com/token".to_string(),
            scopes: vec![],
        };
        assert!(matches!(
            select_auth_source(&options),
            Some(AuthSource::OAuth2RefreshToken(_))
        ));
    }

    struct CountingSupplier {
        calls: Arc<AtomicUsize>,
        lifetime: i64,
    }

    impl TokenSupplier for CountingSupplier {
        fn fetch(&self) -> Result<AccessToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("tok-{}", self.calls.load(Ordering::SeqCst)),
                expires_at: Utc::now() + chrono::Duration::seconds(self.lifetime),
            })
        }
    }

    #[test]
    fn test_token_cached_until_stale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = TokenRefreshTask::new(Box::new(CountingSupplier {
            calls: calls.clone(),
            lifetime: 3600,
        }));

        assert_eq!(task.authorization().unwrap(), "Bearer tok-1");
        assert_eq!(task.authorization().unwrap(), "Bearer tok-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.has_token());
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = TokenRefreshTask::new(Box::new(CountingSupplier {
            calls: calls.clone(),
            lifetime: 3600,
        }));

        assert_eq!(task.authorization().unwrap(), "Bearer tok-1");
        task.invalidate();
        assert!(!task.has_token());
        assert_eq!(task.authorization().unwrap(), "Bearer tok-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stale_token_refreshes() {
        let calls = Arc::new(AtomicUsize::new(0));
        // Lifetime below the refresh margin: always stale.
        let task = TokenRefreshTask::new(Box::new(CountingSupplier {
            calls: calls.clone(),
            lifetime: 10,
        }));

        assert_eq!(task.authorization().unwrap(), "Bearer tok-1");
        assert_eq!(task.authorization().unwrap(), "Bearer tok-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_refresh_single_flight() {
        struct SlowSupplier {
            calls: Arc<AtomicUsize>,
        }
        impl TokenSupplier for SlowSupplier {
            fn fetch(&self) -> Result<AccessToken, AuthError> {
                std::thread::sleep(Duration::from_millis(50));
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(AccessToken {
                    token: "tok".to_string(),
                    expires_at: Utc::now() + chrono::Duration::seconds(3600),
                })
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(TokenRefreshTask::new(Box::new(SlowSupplier {
            calls: calls.clone(),
        })));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let task = task.clone();
                std::thread::spawn(move || task.authorization().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "Bearer tok");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_response_parsing() {
        let token =
            token_from_response(br#"{"access_token":"abc","expires_in":120}"#).unwrap();
        assert_eq!(token.token, "abc");
        assert!(!token.stale());

        let token = token_from_response(br#"{"access_token":"abc","expires_in":30}"#).unwrap();
        assert!(token.stale());

        assert!(token_from_response(b"not json").is_err());
    }

    #[test]
    fn test_form_encoding() {
        assert_eq!(form_encode("abc-123"), "abc-123");
        assert_eq!(form_encode("a b"), "a+b");
        assert_eq!(form_encode("a/b=c"), "a%2Fb%3Dc");
        assert_eq!(
            String::from_utf8(form_body(&[("a", "1"), ("b", "x y")])).unwrap(),
            "a=1&b=x+y"
        );
    }

    #[test]
    fn test_missing_signer_is_clean_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let key_path = dir.path().join("sa.json");
        std::fs::write(
            &key_path,
            br#"{"client_email":"x@y","token_uri":"https://t/token","private_key":"pem"}"#,
        )
        .unwrap();

        let supplier = ServiceAccountSupplier {
            path: key_path,
            scopes: vec![],
            signer: None,
        };
        assert!(matches!(
            supplier.fetch(),
            Err(AuthError::SignerNotConfigured)
        ));
    }
}
