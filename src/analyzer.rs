//! Structured medical analysis of extracted report text.
//!
//! Sends the text to the chat collaborator with a strict JSON contract and
//! enforces that contract on the reply. Anything the model gets wrong
//! (syntax, missing fields, unknown enum values) is rejected here rather
//! than persisted.

use crate::chat::{ChatModel, ChatRequest, Message};
use crate::error::UpstreamError;
use crate::rate_limit::RateLimiter;
use crate::report::MedicalAnalysis;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Keep prompts inside the collaborator's context window.
const MAX_PROMPT_CHARS: usize = 60_000;

const ANALYSIS_PROMPT: &str = r#"You are a medical laboratory report analyst. Extract structured findings from the report text.

Return ONLY a JSON object, no prose, in exactly this shape:
{
  "title": "Short descriptive title for the report",
  "category": "general" | "brain" | "heart",
  "labValues": [
    {
      "name": "Test name, e.g. Hemoglobin",
      "value": "Measured value as written, e.g. 14.2",
      "unit": "Unit as written, e.g. g/dL",
      "normalRange": "Reference interval, e.g. 13.5-17.5",
      "status": "normal" | "high" | "low",
      "isCritical": false,
      "conclusion": "One sentence on what this value means",
      "suggestions": "One sentence of follow-up advice"
    }
  ],
  "diagnoses": [
    {
      "condition": "Name of the finding",
      "details": "What the values show",
      "recommendations": "Suggested next steps"
    }
  ],
  "metadata": {
    "isMedicalReport": true,
    "confidence": 0.0,
    "missingInformation": ["Anything you could not determine"]
  }
}

Rules:
- Every field shown above is required. Use an empty string when the source text gives nothing.
- "category" must be exactly one of general, brain or heart.
- "confidence" is your 0.0-1.0 confidence that the analysis is faithful.
- If the text is not a medical report, set "isMedicalReport" to false, leave "labValues" and "diagnoses" empty, and explain in "missingInformation"."#;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("Too many analysis requests; please retry in a minute")]
    RateLimited,
    #[error("No text to analyze")]
    EmptyInput,
    #[error("The analysis service returned no content")]
    EmptyResponse,
    #[error("The analysis service returned malformed JSON")]
    MalformedJson,
    #[error("The analysis is missing required fields")]
    SchemaViolation,
    #[error("analysis service error: {0}")]
    Collaborator(#[from] UpstreamError),
}

/// Parsed analysis plus the verbatim chat payload for debug mode.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub analysis: MedicalAnalysis,
    pub raw: serde_json::Value,
}

pub struct Analyzer {
    chat: Arc<dyn ChatModel>,
    limiter: Arc<Mutex<RateLimiter>>,
    max_tokens: u32,
}

impl Analyzer {
    pub fn new(chat: Arc<dyn ChatModel>, limiter: Arc<Mutex<RateLimiter>>, max_tokens: u32) -> Self {
        Self {
            chat,
            limiter,
            max_tokens,
        }
    }

    pub async fn analyze(
        &self,
        text: &str,
        user_id: &str,
    ) -> Result<AnalysisOutcome, AnalyzeError> {
        if !self.limiter.lock().unwrap().try_request(user_id) {
            return Err(AnalyzeError::RateLimited);
        }
        if text.trim().is_empty() {
            return Err(AnalyzeError::EmptyInput);
        }

        let request = ChatRequest {
            messages: vec![
                Message::system(ANALYSIS_PROMPT),
                Message::user(truncate_for_context(text, MAX_PROMPT_CHARS)),
            ],
            temperature: 0.2,
            max_tokens: self.max_tokens,
        };

        let output = self.chat.complete(request).await.map_err(|e| {
            log_collaborator_failure("analyze", &e);
            AnalyzeError::Collaborator(e)
        })?;

        if output.content.trim().is_empty() {
            return Err(AnalyzeError::EmptyResponse);
        }

        let analysis: MedicalAnalysis =
            parse_llm_json(&output.content).map_err(|e| match e {
                JsonParseError::Syntax(detail) => {
                    warn!("analyze: malformed JSON from model: {}", detail);
                    AnalyzeError::MalformedJson
                }
                JsonParseError::Shape(detail) => {
                    warn!("analyze: reply violates the contract: {}", detail);
                    AnalyzeError::SchemaViolation
                }
            })?;

        info!(
            "analyze: '{}' ({} lab values, {} diagnoses, confidence {:.2})",
            analysis.title,
            analysis.lab_values.len(),
            analysis.diagnoses.len(),
            analysis.metadata.confidence
        );
        Ok(AnalysisOutcome {
            analysis,
            raw: output.raw,
        })
    }
}

/// One distinct log line per collaborator failure class; callers still map
/// them all to a client-facing validation error.
fn log_collaborator_failure(stage: &str, err: &UpstreamError) {
    match err {
        UpstreamError::AccessDenied(_) => {
            error!("{}: collaborator rejected our credentials", stage)
        }
        UpstreamError::Throttled(_) => warn!("{}: collaborator throttled the request", stage),
        UpstreamError::QuotaExceeded(_) => error!("{}: collaborator quota is exhausted", stage),
        UpstreamError::MalformedRequest(_) => error!("{}: collaborator rejected the request", stage),
        other => warn!("{}: collaborator call failed: {}", stage, other),
    }
}

// ============================================================================
// Reply parsing
// ============================================================================

#[derive(Debug)]
pub(crate) enum JsonParseError {
    Syntax(String),
    Shape(String),
}

/// Extract JSON from the model reply, tolerating markdown code fences.
pub(crate) fn parse_llm_json<T: serde::de::DeserializeOwned>(
    response: &str,
) -> Result<T, JsonParseError> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    // Syntax first, so the two failure modes stay distinguishable.
    let _: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| JsonParseError::Syntax(format!("{}: {}", e, preview(json_str))))?;

    serde_json::from_str(json_str)
        .map_err(|e| JsonParseError::Shape(format!("{}: {}", e, preview(json_str))))
}

fn preview(s: &str) -> String {
    s.chars().take(200).collect()
}

pub(crate) fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}
