//! Identity verification for login.
//!
//! - [`FirebaseVerifier`] checks Firebase ID tokens against Google's published signing keys
//! - [`StaticVerifier`] maps fixed tokens to identities (tests and `DEV_MODE`)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::store::UserProfile;

const GOOGLE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(60 * 60);
/// Minimum gap between key fetches, whatever the cache state.
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(60);

/// A verified identity from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl From<Identity> for UserProfile {
    fn from(identity: Identity) -> Self {
        UserProfile {
            id: identity.uid,
            email: identity.email,
            name: identity.name,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("identity provider unavailable: {0}")]
    Upstream(String),
}

/// Resolves a provider credential to an identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table, optionally accepting any token as its own uid.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, Identity>,
    accept_any: bool,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept every non-empty token; the token itself becomes the uid.
    pub fn accept_any() -> Self {
        Self {
            tokens: HashMap::new(),
            accept_any: true,
        }
    }

    pub fn with_token(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.tokens.get(token) {
            return Ok(identity.clone());
        }
        if self.accept_any && !token.trim().is_empty() {
            return Ok(Identity {
                uid: token.trim().to_string(),
                email: None,
                name: None,
            });
        }
        Err(AuthError::Invalid("unknown token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

/// Signing keys by `kid`, as RSA modulus and exponent.
type KeySet = HashMap<String, (String, String)>;

#[derive(Default)]
struct KeyCache {
    keys: KeySet,
    expires_at: Option<Instant>,
    /// Last fetch attempt, successful or not
    last_fetch: Option<Instant>,
}

impl KeyCache {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |expires| now < expires)
    }

    fn may_refetch(&self, now: Instant) -> bool {
        self.last_fetch
            .map_or(true, |last| now.saturating_duration_since(last) >= MIN_REFETCH_INTERVAL)
    }

    fn fresh_key(&self, kid: &str, now: Instant) -> Option<&(String, String)> {
        if self.is_fresh(now) {
            self.keys.get(kid)
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct FirebaseClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Verifies Firebase ID tokens (RS256, audience = project id).
pub struct FirebaseVerifier {
    client: Client,
    project_id: String,
    keys_url: String,
    keys: RwLock<KeyCache>,
}

impl FirebaseVerifier {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            project_id: project_id.into(),
            keys_url: GOOGLE_JWKS_URL.to_string(),
            keys: RwLock::new(KeyCache::default()),
        }
    }

    /// Fetch signing keys from `url` instead of Google (emulators, tests).
    pub fn with_keys_url(mut self, url: impl Into<String>) -> Self {
        self.keys_url = url.into();
        self
    }

    fn issuer(&self) -> String {
        format!("https://securetoken.google.com/{}", self.project_id)
    }

    async fn fetch_keys(&self) -> Result<(KeySet, Duration), AuthError> {
        let response = self
            .client
            .get(&self.keys_url)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("fetching signing keys: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "signing keys endpoint returned HTTP {}",
                response.status()
            )));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_KEYS_TTL);

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("parsing signing keys: {}", e)))?;

        tracing::debug!("Fetched {} identity provider signing keys", set.keys.len());
        let keys = set.keys.into_iter().map(|k| (k.kid, (k.n, k.e))).collect();
        Ok((keys, ttl))
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        self.key_for_at(kid, Instant::now()).await
    }

    /// Look up `kid`, refreshing the cache when stale or when the key is unknown.
    ///
    /// Refreshes run one at a time under the write lock and at most once per
    /// `MIN_REFETCH_INTERVAL`. A failed refresh keeps serving the previous keys.
    async fn key_for_at(&self, kid: &str, now: Instant) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.keys.read().await;
            if let Some((n, e)) = cache.fresh_key(kid, now) {
                return decoding_key(n, e);
            }
        }

        let mut cache = self.keys.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some((n, e)) = cache.fresh_key(kid, now) {
            return decoding_key(n, e);
        }

        if cache.may_refetch(now) {
            cache.last_fetch = Some(now);
            match self.fetch_keys().await {
                Ok((keys, ttl)) => {
                    cache.keys = keys;
                    cache.expires_at = Some(now + ttl);
                }
                Err(e) if cache.keys.is_empty() => return Err(e),
                Err(e) => tracing::warn!("Signing key refresh failed, using cached keys: {}", e),
            }
        } else if cache.keys.is_empty() {
            return Err(AuthError::Upstream(
                "signing keys unavailable, refetch throttled".to_string(),
            ));
        }

        match cache.keys.get(kid) {
            Some((n, e)) => decoding_key(n, e),
            None => Err(AuthError::Invalid(format!("unknown signing key {}", kid))),
        }
    }
}

fn decoding_key(n: &str, e: &str) -> Result<DecodingKey, AuthError> {
    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| AuthError::Upstream(format!("bad signing key: {}", e)))
}

/// Extract `max-age` seconds from a Cache-Control header value.
fn parse_max_age(value: &str) -> Option<Duration> {
    value
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl IdentityVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::Invalid(format!("malformed token: {}", e)))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Invalid(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Invalid("token has no key id".to_string()))?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.project_id.as_str()]);
        validation.set_issuer(&[self.issuer()]);

        let data = jsonwebtoken::decode::<FirebaseClaims>(token, &key, &validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }

        Ok(Identity {
            uid: data.claims.sub,
            email: data.claims.email,
            name: data.claims.name,
        })
    }
}
