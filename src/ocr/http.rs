//! HTTP provider for the managed OCR collaborator.

use super::{Block, DocumentOcr, OcrOutcome};
use crate::config::ApiKey;
use crate::error::UpstreamError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Analysis features requested on every call: table reconstruction and form
/// (key/value) detection.
const REQUESTED_FEATURES: [&str; 2] = ["tables", "forms"];

pub struct HttpOcrClient {
    client: reqwest::Client,
    base_url: String,
    api_key: ApiKey,
}

impl HttpOcrClient {
    pub fn new(client: reqwest::Client, base_url: String, api_key: ApiKey) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

// ============================================================================
// OCR API request/response types
// ============================================================================

#[derive(Serialize)]
struct AnalyzeDocumentRequest<'a> {
    document: DocumentPayload,
    features: &'a [&'a str],
}

#[derive(Serialize)]
struct DocumentPayload {
    content: String,
    mime_type: String,
}

#[derive(Deserialize)]
struct AnalyzeDocumentResponse {
    #[serde(default)]
    blocks: Vec<Block>,
}

// ============================================================================
// Provider implementation
// ============================================================================

#[async_trait::async_trait]
impl DocumentOcr for HttpOcrClient {
    fn name(&self) -> &str {
        "http_ocr"
    }

    async fn analyze(&self, bytes: &[u8], mime_type: &str) -> Result<OcrOutcome, UpstreamError> {
        let key = self.api_key.resolve().await?;

        let body = AnalyzeDocumentRequest {
            document: DocumentPayload {
                content: BASE64.encode(bytes),
                mime_type: mime_type.to_string(),
            },
            features: &REQUESTED_FEATURES,
        };

        info!(
            "HttpOcrClient: submitting {} byte {} document",
            bytes.len(),
            mime_type
        );

        let resp = self
            .client
            .post(format!("{}/v1/analyze-document", self.base_url))
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, text));
        }

        let raw_text = resp.text().await?;
        debug!("HttpOcrClient: raw response ({} bytes)", raw_text.len());

        let raw: serde_json::Value = serde_json::from_str(&raw_text)
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let parsed: AnalyzeDocumentResponse = serde_json::from_value(raw.clone())
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        debug!("HttpOcrClient: {} blocks recognized", parsed.blocks.len());

        Ok(OcrOutcome {
            blocks: parsed.blocks,
            raw,
        })
    }
}
