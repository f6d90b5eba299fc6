//! Bearer-token authentication.
//!
//! Extracts `Authorization: Bearer <token>`, verifies the JWT against the
//! identity provider's JWKS (RS256, cached for 24 hours), and injects
//! [`AuthUser`] into request extensions for downstream handlers.

use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{AppError, UpstreamError};

/// Re-fetch the key set after this long, or sooner on an unknown `kid`.
const KEY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The caller a verified token belongs to.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signing key is not in the key set")]
    UnknownKey,
    #[error("token was rejected")]
    Rejected,
    #[error("key service error: {0}")]
    KeyService(#[from] UpstreamError),
}

#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError>;
}

/// Shared handle the middleware pulls out of request extensions.
#[derive(Clone)]
pub struct AuthGate {
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Require a valid bearer token on every request.
///
/// Accesses `AuthGate` from request extensions (injected by Extension layer).
/// On success: injects `AuthUser` for downstream handlers.
pub async fn require_auth(req: Request<axum::body::Body>, next: Next) -> Response {
    match require_auth_inner(req, next).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn require_auth_inner(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let gate: AuthGate = req
        .extensions()
        .get::<AuthGate>()
        .cloned()
        .ok_or_else(|| AppError::Internal("missing auth gate".into()))?;

    let token = bearer_token(req.headers())
        .ok_or(AppError::Unauthorized)?
        .to_string();

    let user = match gate.verifier.verify(&token).await {
        Ok(user) => user,
        Err(err) => {
            debug!("require_auth: token rejected: {}", err);
            return Err(AppError::Unauthorized);
        }
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ============================================================================
// JWKS-backed verifier
// ============================================================================

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    #[serde(default)]
    kty: String,
    n: String,
    e: String,
}

struct CachedKeys {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Verifies RS256 tokens against a remote JWKS endpoint.
pub struct JwksVerifier {
    client: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: String,
    keys: Mutex<Option<CachedKeys>>,
}

impl JwksVerifier {
    pub fn new(client: reqwest::Client, jwks_url: String, issuer: String, audience: String) -> Self {
        Self {
            client,
            jwks_url,
            issuer,
            audience,
            keys: Mutex::new(None),
        }
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk, AuthError> {
        if let Some(jwk) = self.cached_key(kid, Instant::now()) {
            return Ok(jwk);
        }

        // Stale cache or unknown kid: re-fetch once and look again.
        let fetched = self.fetch_keys().await?;
        let jwk = fetched.get(kid).cloned();
        *self.keys.lock().unwrap() = Some(CachedKeys {
            keys: fetched,
            fetched_at: Instant::now(),
        });
        jwk.ok_or(AuthError::UnknownKey)
    }

    // Lock is released before any await in `key_for`.
    fn cached_key(&self, kid: &str, now: Instant) -> Option<Jwk> {
        let guard = self.keys.lock().unwrap();
        let cached = guard.as_ref()?;
        if now.duration_since(cached.fetched_at) >= KEY_CACHE_TTL {
            return None;
        }
        cached.keys.get(kid).cloned()
    }

    async fn fetch_keys(&self) -> Result<HashMap<String, Jwk>, AuthError> {
        debug!("JwksVerifier: fetching key set from {}", self.jwks_url);
        let resp = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyService(e.into()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::KeyService(UpstreamError::from_response(
                status, body,
            )));
        }

        let doc: JwksDocument = resp
            .json()
            .await
            .map_err(|e| AuthError::KeyService(UpstreamError::Decode(e.to_string())))?;

        Ok(doc
            .keys
            .into_iter()
            .filter(|k| k.kty == "RSA")
            .map(|k| (k.kid.clone(), k))
            .collect())
    }

    #[cfg(test)]
    fn seed_keys(&self, keys: Vec<(&str, &str, &str)>, fetched_at: Instant) {
        let map = keys
            .into_iter()
            .map(|(kid, n, e)| {
                (
                    kid.to_string(),
                    Jwk {
                        kid: kid.to_string(),
                        kty: "RSA".to_string(),
                        n: n.to_string(),
                        e: e.to_string(),
                    },
                )
            })
            .collect();
        *self.keys.lock().unwrap() = Some(CachedKeys {
            keys: map,
            fetched_at,
        });
    }
}

#[async_trait::async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        let kid = header.kid.ok_or(AuthError::Malformed)?;

        let jwk = self.key_for(&kid).await?;
        let key =
            DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(|_| AuthError::Rejected)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = decode::<Claims>(token, &key, &validation).map_err(|_| AuthError::Rejected)?;
        Ok(AuthUser {
            user_id: data.claims.sub,
        })
    }
}

// ============================================================================
// Test doubles
// ============================================================================

/// Accepts exactly one token; everything else is rejected.
#[cfg(test)]
pub struct StaticVerifier {
    pub token: String,
    pub user_id: String,
}

#[cfg(test)]
#[async_trait::async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        if token == self.token {
            Ok(AuthUser {
                user_id: self.user_id.clone(),
            })
        } else {
            Err(AuthError::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn test_verifier() -> JwksVerifier {
        JwksVerifier::new(
            reqwest::Client::new(),
            "http://auth.test/jwks".into(),
            "http://auth.test".into(),
            "authenticated".into(),
        )
    }

    #[test]
    fn bearer_token_strips_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn bearer_token_rejects_other_schemes_and_absence() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("Authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn garbage_token_is_malformed_without_network() {
        let verifier = test_verifier();
        let err = verifier.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }

    #[tokio::test]
    async fn token_without_kid_is_malformed() {
        #[derive(serde::Serialize)]
        struct TestClaims {
            sub: String,
            exp: usize,
        }
        // HS256 with no kid: readable header, but nothing to look up.
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &TestClaims {
                sub: "user-1".into(),
                exp: 4_000_000_000,
            },
            &jsonwebtoken::EncodingKey::from_secret(b"test"),
        )
        .unwrap();

        let verifier = test_verifier();
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }

    #[test]
    fn cached_key_honors_ttl_and_kid() {
        let verifier = test_verifier();
        let fetched = Instant::now();
        verifier.seed_keys(vec![("key-1", "AQAB", "AQAB")], fetched);

        assert!(verifier.cached_key("key-1", fetched).is_some());
        assert!(verifier.cached_key("key-2", fetched).is_none());
        assert!(verifier
            .cached_key("key-1", fetched + Duration::from_secs(25 * 60 * 60))
            .is_none());
    }

    #[tokio::test]
    async fn static_verifier_matches_exact_token() {
        let verifier = StaticVerifier {
            token: "good".into(),
            user_id: "user-1".into(),
        };
        assert_eq!(verifier.verify("good").await.unwrap().user_id, "user-1");
        assert!(verifier.verify("bad").await.is_err());
    }
}
