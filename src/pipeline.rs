//! Document processing pipeline and async status tracking.
//!
//! The pipeline drives one document through extract -> analyze -> review ->
//! explain, persisting report status around the work: `in_progress` is
//! written before any stage runs, and every exit path lands on `processed`
//! or `failed`. Background runs go through [`Pipeline::dispatch`], which
//! guarantees at most one concurrent run per report.

use anyhow::Context;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::analyzer::{AnalyzeError, Analyzer};
use crate::error::{AppError, UpstreamError};
use crate::extraction::{ExtractError, ExtractionService};
use crate::files;
use crate::ocr::ExtractedText;
use crate::report::{MedicalAnalysis, ProcessingStatus, Report};
use crate::review::Reviewer;
use crate::store::{FileStore, ReportStore};

/// A stage failure; everything here is reported to clients as a validation
/// problem with the stage's own message.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Analyze(#[from] AnalyzeError),
}

/// Everything the pipeline produced for one document.
#[derive(Debug)]
pub struct ProcessedDocument {
    pub extracted: ExtractedText,
    pub analysis: MedicalAnalysis,
    pub explanation: Option<String>,
    pub raw_ocr: serde_json::Value,
    pub raw_analysis: serde_json::Value,
}

/// Tracks which reports are currently being processed, so a report cannot
/// be double-processed by concurrent requests.
#[derive(Default)]
pub struct Dispatcher {
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    /// Claim a report for processing. Returns false when someone else holds it.
    fn begin(&self, report_id: &str) -> bool {
        self.in_flight.lock().unwrap().insert(report_id.to_string())
    }

    fn finish(&self, report_id: &str) {
        self.in_flight.lock().unwrap().remove(report_id);
    }

    pub fn is_in_flight(&self, report_id: &str) -> bool {
        self.in_flight.lock().unwrap().contains(report_id)
    }
}

pub struct Pipeline {
    extraction: Arc<ExtractionService>,
    analyzer: Analyzer,
    reviewer: Reviewer,
    reports: Arc<dyn ReportStore>,
    files: Arc<dyn FileStore>,
    pub dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(
        extraction: Arc<ExtractionService>,
        analyzer: Analyzer,
        reviewer: Reviewer,
        reports: Arc<dyn ReportStore>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            extraction,
            analyzer,
            reviewer,
            reports,
            files,
            dispatcher: Dispatcher::default(),
        }
    }

    /// Extract, analyze, review and explain one document.
    ///
    /// Review and explanation are best-effort and cannot fail this function.
    async fn run_stages(
        &self,
        bytes: &[u8],
        mime_type: &str,
        user_id: &str,
    ) -> Result<ProcessedDocument, StageError> {
        let extract = self.extraction.extract(bytes, mime_type, user_id).await?;
        let analyzed = self
            .analyzer
            .analyze(&extract.text.raw_text, user_id)
            .await?;
        let reviewed = self
            .reviewer
            .review(&analyzed.analysis, &extract.text.raw_text, user_id)
            .await;
        let explanation = self.reviewer.explain(&reviewed, user_id).await;

        Ok(ProcessedDocument {
            extracted: extract.text,
            analysis: reviewed,
            explanation,
            raw_ocr: extract.raw,
            raw_analysis: analyzed.raw,
        })
    }

    /// Process an upload inside the request, updating `report` in place.
    ///
    /// The `in_progress` write happens before any stage, so a poller sees
    /// the report as busy even while processing is synchronous.
    pub async fn process_upload(
        &self,
        report: &mut Report,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ProcessedDocument, AppError> {
        report.processing_status = ProcessingStatus::InProgress;
        report.touch();
        self.reports.update(report).await.map_err(store_error)?;

        match self.run_stages(bytes, mime_type, &report.user_id).await {
            Ok(doc) => {
                merge_outcome(report, &doc);
                self.reports.update(report).await.map_err(store_error)?;
                info!("process_upload: report {} processed", report.id);
                Ok(doc)
            }
            Err(err) => {
                report.processing_status = ProcessingStatus::Failed;
                report.debug_message = Some(err.to_string());
                report.touch();
                if let Err(persist_err) = self.reports.update(report).await {
                    error!(
                        "process_upload: could not persist failure for {}: {}",
                        report.id, persist_err
                    );
                }
                Err(AppError::Validation(err.to_string()))
            }
        }
    }

    /// Background half of the deferred flow: load the stored document and
    /// run the stages, leaving the report `processed` or `failed`.
    pub async fn process_report(&self, report_id: &str, user_id: &str) {
        let mut report = match self.reports.fetch(report_id, user_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!("process_report: report {} not found", report_id);
                return;
            }
            Err(err) => {
                error!("process_report: cannot load report {}: {}", report_id, err);
                return;
            }
        };

        if let Err(err) = self.run_stored(&mut report).await {
            warn!("process_report: report {} failed: {:#}", report.id, err);
            report.processing_status = ProcessingStatus::Failed;
            report.debug_message = Some(format!("{:#}", err));
            report.touch();
            if let Err(persist_err) = self.reports.update(&report).await {
                error!(
                    "process_report: could not persist failure for {}: {}",
                    report.id, persist_err
                );
            }
        }
    }

    async fn run_stored(&self, report: &mut Report) -> anyhow::Result<()> {
        let bytes = self
            .files
            .fetch(&report.file_path)
            .await
            .context("cannot load stored document")?;
        let kind = files::sniff(&bytes).context("stored document has an unrecognized format")?;

        let doc = self
            .run_stages(&bytes, kind.mime(), &report.user_id)
            .await?;
        merge_outcome(report, &doc);
        self.reports
            .update(report)
            .await
            .context("cannot persist analysis")?;
        info!("process_report: report {} processed", report.id);
        Ok(())
    }

    /// Spawn background processing for a report.
    ///
    /// Returns false without spawning when the report is already in flight.
    pub fn dispatch(self: &Arc<Self>, report_id: String, user_id: String) -> bool {
        if !self.dispatcher.begin(&report_id) {
            return false;
        }

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.process_report(&report_id, &user_id).await;
            pipeline.dispatcher.finish(&report_id);
        });
        true
    }

    /// Status view for polling clients. `None` when the report does not
    /// exist (or belongs to someone else).
    pub async fn report_status(
        &self,
        report_id: &str,
        user_id: &str,
    ) -> Result<Option<StatusView>, UpstreamError> {
        let report = self.reports.fetch(report_id, user_id).await?;
        Ok(report.map(|r| StatusView {
            report_id: r.id,
            status: r.processing_status,
            is_complete: r.processing_status == ProcessingStatus::Processed,
        }))
    }
}

fn store_error(err: UpstreamError) -> AppError {
    AppError::Internal(format!("store error: {}", err))
}

/// Fold a finished pipeline run into the report row.
pub fn merge_outcome(report: &mut Report, doc: &ProcessedDocument) {
    let analysis = &doc.analysis;
    report.title = analysis.title.clone();
    report.category = analysis.category;
    report.confidence = analysis.metadata.confidence.clamp(0.0, 1.0);
    report.lab_values = analysis.lab_values.clone();
    report.summary = match &doc.explanation {
        Some(text) => text.clone(),
        None => diagnosis_digest(analysis),
    };
    report.processing_status = ProcessingStatus::Processed;
    report.debug_message = None;
    report.touch();
}

fn diagnosis_digest(analysis: &MedicalAnalysis) -> String {
    if analysis.diagnoses.is_empty() {
        return "No findings were flagged in this report.".to_string();
    }
    analysis
        .diagnoses
        .iter()
        .map(|d| d.condition.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub report_id: String,
    pub status: ProcessingStatus,
    pub is_complete: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDocumentResult {
    pub extracted_text: ExtractedText,
    pub analysis: MedicalAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplified_explanation: Option<String>,
    pub processing_metadata: ProcessingMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawPayloads>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub processing_time_ms: u64,
    pub file_type: String,
    pub file_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayloads {
    pub ocr: serde_json::Value,
    pub analysis: serde_json::Value,
}

impl ProcessedDocumentResult {
    pub fn from_document(
        doc: ProcessedDocument,
        meta: ProcessingMetadata,
        include_raw: bool,
    ) -> Self {
        let raw = include_raw.then(|| RawPayloads {
            ocr: doc.raw_ocr,
            analysis: doc.raw_analysis,
        });
        Self {
            extracted_text: doc.extracted,
            analysis: doc.analysis,
            simplified_explanation: doc.explanation,
            processing_metadata: meta,
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatModel, ScriptedChat};
    use crate::files::tests::sample_pdf;
    use crate::ocr::{Block, StubOcr};
    use crate::rate_limit::RateLimiter;
    use crate::report::Diagnosis;
    use crate::store::{MemoryFileStore, MemoryReportStore};

    fn line(text: &str) -> Block {
        Block::Line { text: text.into() }
    }

    fn analysis_json() -> &'static str {
        r#"{
            "title": "Complete Blood Count",
            "category": "general",
            "labValues": [{
                "name": "Hemoglobin",
                "value": "14.2",
                "unit": "g/dL",
                "normalRange": "13.5-17.5",
                "status": "normal",
                "isCritical": false,
                "conclusion": "Within the reference interval.",
                "suggestions": "No action needed."
            }],
            "diagnoses": [],
            "metadata": {
                "isMedicalReport": true,
                "confidence": 0.9,
                "missingInformation": []
            }
        }"#
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        reports: Arc<MemoryReportStore>,
        files: Arc<MemoryFileStore>,
    }

    /// Chat script order per document: analyze, then review, then explain.
    /// A short script makes the optional stages fall back.
    fn harness(blocks: Vec<Block>, script: Vec<Result<String, UpstreamError>>) -> Harness {
        let ocr = Arc::new(StubOcr::returning(blocks));
        let chat: Arc<dyn ChatModel> = Arc::new(ScriptedChat::new(script));
        let ocr_limiter = Arc::new(Mutex::new(RateLimiter::per_minute(100)));
        let chat_limiter = Arc::new(Mutex::new(RateLimiter::per_minute(100)));
        let reports = Arc::new(MemoryReportStore::default());
        let files = Arc::new(MemoryFileStore::default());

        let pipeline = Pipeline::new(
            Arc::new(ExtractionService::new(ocr, ocr_limiter)),
            Analyzer::new(chat.clone(), chat_limiter.clone(), 4096),
            Reviewer::new(chat, chat_limiter, 4096),
            reports.clone() as Arc<dyn ReportStore>,
            files.clone() as Arc<dyn FileStore>,
        );

        Harness {
            pipeline: Arc::new(pipeline),
            reports,
            files,
        }
    }

    #[tokio::test]
    async fn inline_run_walks_the_status_machine_and_merges() {
        let h = harness(
            vec![
                line("BLOOD TEST RESULTS"),
                line("Hemoglobin 14.2 g/dL"),
            ],
            vec![Ok(analysis_json().into())],
        );

        let mut report = Report::new("user-1", "Untitled report");
        h.reports.create(&report).await.unwrap();

        let doc = h
            .pipeline
            .process_upload(&mut report, &sample_pdf(), "application/pdf")
            .await
            .unwrap();

        // The stubbed lab value flows through review fallback untouched.
        assert_eq!(doc.analysis.lab_values[0].name, "Hemoglobin");
        assert_eq!(doc.extracted.raw_text, "BLOOD TEST RESULTS\nHemoglobin 14.2 g/dL");

        assert_eq!(report.processing_status, ProcessingStatus::Processed);
        assert_eq!(report.title, "Complete Blood Count");
        assert_eq!(report.confidence, 0.9);
        assert_eq!(report.lab_values.len(), 1);
        assert!(report.debug_message.is_none());

        let log = h.reports.status_log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ProcessingStatus::Unprocessed,
                ProcessingStatus::InProgress,
                ProcessingStatus::Processed,
            ]
        );
    }

    #[tokio::test]
    async fn inline_failure_lands_on_failed_with_a_debug_message() {
        // Empty script: the analysis call itself fails.
        let h = harness(vec![line("text")], vec![]);

        let mut report = Report::new("user-1", "Untitled report");
        h.reports.create(&report).await.unwrap();

        let err = h
            .pipeline
            .process_upload(&mut report, &sample_pdf(), "application/pdf")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(report.processing_status, ProcessingStatus::Failed);
        assert!(report.debug_message.is_some());

        let log = h.reports.status_log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ProcessingStatus::Unprocessed,
                ProcessingStatus::InProgress,
                ProcessingStatus::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn background_run_loads_the_stored_document() {
        let h = harness(
            vec![line("Hemoglobin 14.2")],
            vec![Ok(analysis_json().into())],
        );

        let mut report = Report::new("user-1", "Untitled report");
        report.file_path = "user-1/r1/abcd.pdf".into();
        report.processing_status = ProcessingStatus::InProgress;
        h.reports.create(&report).await.unwrap();
        h.files
            .put(&report.file_path, sample_pdf(), "application/pdf")
            .await
            .unwrap();

        h.pipeline.process_report(&report.id, "user-1").await;

        let stored = h.reports.fetch(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Processed);
        assert_eq!(stored.title, "Complete Blood Count");
    }

    #[tokio::test]
    async fn background_run_with_missing_object_marks_failed() {
        let h = harness(vec![line("x")], vec![Ok(analysis_json().into())]);

        let mut report = Report::new("user-1", "Untitled report");
        report.file_path = "user-1/r1/gone.pdf".into();
        report.processing_status = ProcessingStatus::InProgress;
        h.reports.create(&report).await.unwrap();

        h.pipeline.process_report(&report.id, "user-1").await;

        let stored = h.reports.fetch(&report.id, "user-1").await.unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Failed);
        assert!(stored
            .debug_message
            .as_deref()
            .unwrap()
            .contains("cannot load stored document"));
    }

    #[test]
    fn dispatcher_claims_are_exclusive_until_finished() {
        let d = Dispatcher::default();
        assert!(d.begin("r1"));
        assert!(!d.begin("r1"));
        assert!(d.is_in_flight("r1"));
        assert!(d.begin("r2"));

        d.finish("r1");
        assert!(!d.is_in_flight("r1"));
        assert!(d.begin("r1"));
    }

    #[tokio::test]
    async fn dispatch_runs_the_report_to_processed() {
        let h = harness(
            vec![line("Hemoglobin 14.2")],
            vec![Ok(analysis_json().into())],
        );

        let mut report = Report::new("user-1", "Untitled report");
        report.file_path = "user-1/r1/abcd.pdf".into();
        report.processing_status = ProcessingStatus::InProgress;
        h.reports.create(&report).await.unwrap();
        h.files
            .put(&report.file_path, sample_pdf(), "application/pdf")
            .await
            .unwrap();

        assert!(h.pipeline.dispatch(report.id.clone(), "user-1".into()));

        let mut status = None;
        for _ in 0..200 {
            let view = h
                .pipeline
                .report_status(&report.id, "user-1")
                .await
                .unwrap()
                .unwrap();
            if view.is_complete {
                status = Some(view.status);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(status, Some(ProcessingStatus::Processed));
    }

    #[tokio::test]
    async fn status_polling_is_idempotent_and_scoped() {
        let h = harness(vec![], vec![]);
        let report = Report::new("user-1", "Untitled report");
        h.reports.create(&report).await.unwrap();

        for _ in 0..3 {
            let view = h
                .pipeline
                .report_status(&report.id, "user-1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(view.status, ProcessingStatus::Unprocessed);
            assert!(!view.is_complete);
        }

        assert!(h
            .pipeline
            .report_status(&report.id, "someone-else")
            .await
            .unwrap()
            .is_none());
        assert!(h
            .pipeline
            .report_status("missing", "user-1")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn merge_clamps_confidence_and_prefers_the_explanation() {
        let mut analysis: MedicalAnalysis = serde_json::from_str(analysis_json()).unwrap();
        analysis.metadata.confidence = 1.7;

        let doc = ProcessedDocument {
            extracted: ExtractedText::default(),
            analysis: analysis.clone(),
            explanation: Some("Everything looks fine.".into()),
            raw_ocr: serde_json::Value::Null,
            raw_analysis: serde_json::Value::Null,
        };

        let mut report = Report::new("user-1", "Untitled");
        merge_outcome(&mut report, &doc);
        assert_eq!(report.confidence, 1.0);
        assert_eq!(report.summary, "Everything looks fine.");

        // Without an explanation, the summary digests the diagnoses.
        let mut doc = doc;
        doc.explanation = None;
        doc.analysis.diagnoses = vec![
            Diagnosis {
                condition: "Mild anemia".into(),
                details: "".into(),
                recommendations: "".into(),
            },
            Diagnosis {
                condition: "Low ferritin".into(),
                details: "".into(),
                recommendations: "".into(),
            },
        ];
        merge_outcome(&mut report, &doc);
        assert_eq!(report.summary, "Mild anemia; Low ferritin");

        doc.analysis.diagnoses.clear();
        merge_outcome(&mut report, &doc);
        assert_eq!(report.summary, "No findings were flagged in this report.");
    }

    #[test]
    fn result_payload_uses_wire_names_and_omits_raw() {
        let analysis: MedicalAnalysis = serde_json::from_str(analysis_json()).unwrap();
        let doc = ProcessedDocument {
            extracted: ExtractedText::default(),
            analysis,
            explanation: None,
            raw_ocr: serde_json::json!({"blocks": []}),
            raw_analysis: serde_json::Value::Null,
        };
        let result = ProcessedDocumentResult::from_document(
            doc,
            ProcessingMetadata {
                processing_time_ms: 120,
                file_type: "application/pdf".into(),
                file_size: 1024,
            },
            false,
        );

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("extractedText").is_some());
        assert_eq!(json["processingMetadata"]["processingTimeMs"], 120);
        assert_eq!(json["processingMetadata"]["fileType"], "application/pdf");
        assert!(json.get("raw").is_none());
        assert!(json.get("simplifiedExplanation").is_none());
    }
}
