//! Text extraction from uploaded documents.
//!
//! Wraps the OCR collaborator behind per-user rate limiting and file
//! validation, and assembles its block graph into [`ExtractedText`].

use crate::error::UpstreamError;
use crate::files::{self, FileError};
use crate::ocr::{self, DocumentOcr, ExtractedText};
use crate::rate_limit::RateLimiter;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Hard cap on documents per batch request.
pub const MAX_BATCH_ITEMS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Too many extraction requests; please retry in a minute")]
    RateLimited,
    #[error(transparent)]
    InvalidFile(#[from] FileError),
    #[error("The document produced no recognizable text")]
    EmptyResponse,
    #[error("A batch may contain at most {MAX_BATCH_ITEMS} documents (got {0})")]
    BatchTooLarge(usize),
    #[error("document analysis service error: {0}")]
    Collaborator(#[from] UpstreamError),
}

/// Assembled text plus the verbatim OCR payload for debug mode.
#[derive(Debug)]
pub struct ExtractOutcome {
    pub text: ExtractedText,
    pub raw: serde_json::Value,
}

/// One document in a batch request.
pub struct BatchItem {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub struct ExtractionService {
    ocr: Arc<dyn DocumentOcr>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl ExtractionService {
    pub fn new(ocr: Arc<dyn DocumentOcr>, limiter: Arc<Mutex<RateLimiter>>) -> Self {
        Self { ocr, limiter }
    }

    /// Run one document through validation and OCR.
    ///
    /// The rate limiter is consulted first, so an over-quota caller spends
    /// nothing on validation or the collaborator.
    pub async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
        user_id: &str,
    ) -> Result<ExtractOutcome, ExtractError> {
        if !self.limiter.lock().unwrap().try_request(user_id) {
            return Err(ExtractError::RateLimited);
        }

        files::validate(bytes, mime_type)?;

        let outcome = self.ocr.analyze(bytes, mime_type).await?;
        if outcome.blocks.is_empty() {
            return Err(ExtractError::EmptyResponse);
        }

        let text = ocr::assemble(&outcome.blocks);
        info!(
            "extract: {} blocks -> {} lines, {} tables, {} key-value pairs",
            outcome.blocks.len(),
            text.lines.len(),
            text.tables.len(),
            text.key_value_pairs.len()
        );
        Ok(ExtractOutcome {
            text,
            raw: outcome.raw,
        })
    }

    /// Extract a batch of documents in order.
    ///
    /// The size cap fails the whole request; a failing item only yields an
    /// empty placeholder at its position.
    pub async fn extract_batch(
        &self,
        items: Vec<BatchItem>,
        user_id: &str,
    ) -> Result<Vec<ExtractedText>, ExtractError> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(ExtractError::BatchTooLarge(items.len()));
        }

        let mut results = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            match self.extract(&item.bytes, &item.mime_type, user_id).await {
                Ok(outcome) => results.push(outcome.text),
                Err(err) => {
                    warn!("extract_batch: item {} failed: {}", idx, err);
                    results.push(ExtractedText::default());
                }
            }
        }
        Ok(results)
    }
}
