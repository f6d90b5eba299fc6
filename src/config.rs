//! Runtime settings and collaborator credentials.
//!
//! Settings come from environment variables. API keys are either static
//! (from the environment) or managed: fetched from a secrets service and
//! cached in memory with a 15-minute TTL.

use crate::error::UpstreamError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a fetched secret stays usable before a re-fetch.
const SECRET_TTL: Duration = Duration::from_secs(15 * 60);

/// Everything the server reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,

    pub ocr_api_url: String,
    pub ocr_api_key: Option<String>,
    pub ocr_secret_name: Option<String>,
    pub ocr_requests_per_minute: u32,

    pub chat_api_url: String,
    pub chat_model: String,
    pub chat_max_tokens: u32,
    pub chat_api_key: Option<String>,
    pub chat_secret_name: Option<String>,
    pub chat_requests_per_minute: u32,

    pub table_api_url: String,
    pub table_service_key: String,
    pub storage_bucket: String,

    pub auth_jwks_url: String,
    pub auth_issuer: String,
    pub auth_audience: String,

    pub secrets_api_url: Option<String>,
    pub secrets_access_key: Option<String>,

    /// Include verbatim collaborator payloads in responses (debug builds of
    /// client apps only).
    pub debug_payloads: bool,
    /// Run the full pipeline inside the upload request instead of deferring
    /// to a background task.
    pub inline_processing: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            ocr_api_url: std::env::var("OCR_API_URL").context("OCR_API_URL must be set")?,
            ocr_api_key: std::env::var("OCR_API_KEY").ok(),
            ocr_secret_name: std::env::var("OCR_SECRET_NAME").ok(),
            ocr_requests_per_minute: env_u32("OCR_REQUESTS_PER_MINUTE", 10),

            chat_api_url: std::env::var("CHAT_API_URL").context("CHAT_API_URL must be set")?,
            chat_model: std::env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "med-analyst-1".to_string()),
            chat_max_tokens: env_u32("CHAT_MAX_TOKENS", 4096),
            chat_api_key: std::env::var("CHAT_API_KEY").ok(),
            chat_secret_name: std::env::var("CHAT_SECRET_NAME").ok(),
            chat_requests_per_minute: env_u32("CHAT_REQUESTS_PER_MINUTE", 20),

            table_api_url: std::env::var("TABLE_API_URL").context("TABLE_API_URL must be set")?,
            table_service_key: std::env::var("TABLE_SERVICE_KEY")
                .context("TABLE_SERVICE_KEY must be set")?,
            storage_bucket: std::env::var("STORAGE_BUCKET")
                .unwrap_or_else(|_| "lab-reports".to_string()),

            auth_jwks_url: std::env::var("AUTH_JWKS_URL").context("AUTH_JWKS_URL must be set")?,
            auth_issuer: std::env::var("AUTH_ISSUER").context("AUTH_ISSUER must be set")?,
            auth_audience: std::env::var("AUTH_AUDIENCE")
                .unwrap_or_else(|_| "authenticated".to_string()),

            secrets_api_url: std::env::var("SECRETS_API_URL").ok(),
            secrets_access_key: std::env::var("SECRETS_ACCESS_KEY").ok(),

            debug_payloads: env_bool("DEBUG_PAYLOADS", false),
            inline_processing: env_bool("INLINE_PROCESSING", true),
        })
    }

    /// Build the secret cache when a secrets service is configured.
    pub fn secret_cache(&self, client: &reqwest::Client) -> Option<SecretCache> {
        match (&self.secrets_api_url, &self.secrets_access_key) {
            (Some(url), Some(key)) => {
                Some(SecretCache::new(client.clone(), url.clone(), key.clone()))
            }
            _ => None,
        }
    }

    pub fn ocr_key(&self, secrets: Option<&SecretCache>) -> Result<ApiKey> {
        resolve_key(
            "OCR",
            self.ocr_api_key.as_deref(),
            self.ocr_secret_name.as_deref(),
            secrets,
        )
    }

    pub fn chat_key(&self, secrets: Option<&SecretCache>) -> Result<ApiKey> {
        resolve_key(
            "CHAT",
            self.chat_api_key.as_deref(),
            self.chat_secret_name.as_deref(),
            secrets,
        )
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            ocr_api_url: "http://ocr.test".into(),
            ocr_api_key: Some("ocr-key".into()),
            ocr_secret_name: None,
            ocr_requests_per_minute: 10,
            chat_api_url: "http://chat.test".into(),
            chat_model: "med-analyst-1".into(),
            chat_max_tokens: 4096,
            chat_api_key: Some("chat-key".into()),
            chat_secret_name: None,
            chat_requests_per_minute: 20,
            table_api_url: "http://table.test".into(),
            table_service_key: "service-key".into(),
            storage_bucket: "lab-reports".into(),
            auth_jwks_url: "http://auth.test/jwks".into(),
            auth_issuer: "http://auth.test".into(),
            auth_audience: "authenticated".into(),
            secrets_api_url: None,
            secrets_access_key: None,
            debug_payloads: false,
            inline_processing: true,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// A static key wins over a managed secret name when both are configured.
fn resolve_key(
    label: &str,
    static_key: Option<&str>,
    secret_name: Option<&str>,
    secrets: Option<&SecretCache>,
) -> Result<ApiKey> {
    if let Some(key) = static_key {
        return Ok(ApiKey::Static(key.to_string()));
    }
    match (secret_name, secrets) {
        (Some(name), Some(cache)) => Ok(ApiKey::Managed {
            cache: cache.clone(),
            secret_name: name.to_string(),
        }),
        (Some(_), None) => anyhow::bail!(
            "{} key names a managed secret but no secrets service is configured",
            label
        ),
        (None, _) => anyhow::bail!(
            "{} key missing: set {}_API_KEY or {}_SECRET_NAME",
            label,
            label,
            label
        ),
    }
}

// ============================================================================
// API keys
// ============================================================================

/// Credential for one collaborator, resolved per request so managed secrets
/// pick up rotations.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub enum ApiKey {
    Static(String),
    Managed {
        cache: SecretCache,
        secret_name: String,
    },
}

impl ApiKey {
    pub async fn resolve(&self) -> Result<String, UpstreamError> {
        match self {
            ApiKey::Static(key) => Ok(key.clone()),
            ApiKey::Managed { cache, secret_name } => cache.get(secret_name).await,
        }
    }
}

// ============================================================================
// Secret cache
// ============================================================================

#[cfg_attr(test, derive(Debug))]
struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

/// In-memory cache over the secrets service: one GET per secret per TTL
/// window.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub struct SecretCache {
    client: reqwest::Client,
    base_url: String,
    access_key: String,
    entries: Arc<Mutex<HashMap<String, CachedSecret>>>,
}

#[derive(Debug, Deserialize)]
struct SecretPayload {
    value: String,
}

impl SecretCache {
    pub fn new(client: reqwest::Client, base_url: String, access_key: String) -> Self {
        Self {
            client,
            base_url,
            access_key,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, name: &str) -> Result<String, UpstreamError> {
        if let Some(value) = self.fresh_value(name, Instant::now()) {
            return Ok(value);
        }

        debug!("SecretCache: fetching secret '{}'", name);
        let resp = self
            .client
            .get(format!("{}/v1/secrets/{}", self.base_url, name))
            .bearer_auth(&self.access_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, body));
        }

        let payload: SecretPayload = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        self.entries.lock().unwrap().insert(
            name.to_string(),
            CachedSecret {
                value: payload.value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(payload.value)
    }

    // Lock is released before any await in `get`.
    fn fresh_value(&self, name: &str, now: Instant) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(name)
            .filter(|e| now.duration_since(e.fetched_at) < SECRET_TTL)
            .map(|e| e.value.clone())
    }

    #[cfg(test)]
    pub fn seed(&self, name: &str, value: &str, fetched_at: Instant) {
        self.entries.lock().unwrap().insert(
            name.to_string(),
            CachedSecret {
                value: value.to_string(),
                fetched_at,
            },
        );
    }
}
