//! Best-effort second pass over a finished analysis.
//!
//! A second model call cross-checks the structured analysis against the
//! original text, and another produces a plain-language explanation. Both
//! are strictly optional: any failure here logs and falls back, it never
//! fails the pipeline.

use crate::analyzer::{parse_llm_json, truncate_for_context, JsonParseError};
use crate::chat::{ChatModel, ChatRequest, Message};
use crate::rate_limit::RateLimiter;
use crate::report::MedicalAnalysis;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const MAX_REVIEW_CHARS: usize = 40_000;

const REVIEW_PROMPT: &str = r#"You are a senior clinician double-checking a junior analyst's structured reading of a lab report.

You receive the original report text and the proposed analysis JSON. Correct any mistakes: wrong statuses, wrong reference ranges, findings the text does not support, lab values that were missed.

Return ONLY the corrected analysis as a JSON object with the same shape as the input. Do not add or remove fields."#;

const EXPLAIN_PROMPT: &str = r#"You explain lab results to patients in plain language.

Write a short explanation (3-6 sentences) of the findings below for someone with no medical background. No jargon, no JSON, no headings. Do not give a diagnosis; describe what the values mean and what a sensible next step is."#;

pub struct Reviewer {
    chat: Arc<dyn ChatModel>,
    limiter: Arc<Mutex<RateLimiter>>,
    max_tokens: u32,
}

impl Reviewer {
    pub fn new(chat: Arc<dyn ChatModel>, limiter: Arc<Mutex<RateLimiter>>, max_tokens: u32) -> Self {
        Self {
            chat,
            limiter,
            max_tokens,
        }
    }

    /// Cross-check `analysis` against the report text.
    ///
    /// Returns the corrected analysis on success and the input unchanged on
    /// any failure. The reviewer may not touch `metadata`; those fields are
    /// restored from the input regardless of what the model returns.
    pub async fn review(
        &self,
        analysis: &MedicalAnalysis,
        original_text: &str,
        user_id: &str,
    ) -> MedicalAnalysis {
        match self.try_review(analysis, original_text, user_id).await {
            Ok(mut corrected) => {
                corrected.metadata = analysis.metadata.clone();
                info!("review: accepted corrections for '{}'", corrected.title);
                corrected
            }
            Err(err) => {
                warn!("review: falling back to unreviewed analysis: {}", err);
                analysis.clone()
            }
        }
    }

    async fn try_review(
        &self,
        analysis: &MedicalAnalysis,
        original_text: &str,
        user_id: &str,
    ) -> anyhow::Result<MedicalAnalysis> {
        if !self.limiter.lock().unwrap().try_request(user_id) {
            anyhow::bail!("review quota exhausted for this user");
        }

        let payload = serde_json::to_string_pretty(analysis)?;
        let user_msg = format!(
            "REPORT TEXT:\n{}\n\nPROPOSED ANALYSIS:\n{}",
            truncate_for_context(original_text, MAX_REVIEW_CHARS),
            payload
        );

        let output = self
            .chat
            .complete(ChatRequest {
                messages: vec![Message::system(REVIEW_PROMPT), Message::user(user_msg)],
                temperature: 0.0,
                max_tokens: self.max_tokens,
            })
            .await?;

        if output.content.trim().is_empty() {
            anyhow::bail!("empty review reply");
        }

        parse_llm_json(&output.content).map_err(|e| match e {
            JsonParseError::Syntax(d) => anyhow::anyhow!("review reply is not JSON: {}", d),
            JsonParseError::Shape(d) => {
                anyhow::anyhow!("review reply violates the contract: {}", d)
            }
        })
    }

    /// Produce a plain-language explanation of the findings, or `None` when
    /// anything goes wrong.
    pub async fn explain(&self, analysis: &MedicalAnalysis, user_id: &str) -> Option<String> {
        match self.try_explain(analysis, user_id).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!("explain: skipping plain-language explanation: {}", err);
                None
            }
        }
    }

    async fn try_explain(
        &self,
        analysis: &MedicalAnalysis,
        user_id: &str,
    ) -> anyhow::Result<String> {
        if !self.limiter.lock().unwrap().try_request(user_id) {
            anyhow::bail!("explanation quota exhausted for this user");
        }

        let payload = serde_json::to_string_pretty(analysis)?;
        let output = self
            .chat
            .complete(ChatRequest {
                messages: vec![Message::system(EXPLAIN_PROMPT), Message::user(payload)],
                temperature: 0.4,
                max_tokens: self.max_tokens,
            })
            .await?;

        let text = output.content.trim().to_string();
        if text.is_empty() {
            anyhow::bail!("empty explanation reply");
        }
        Ok(text)
    }
}
