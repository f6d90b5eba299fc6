//! Medical report processing server: upload lab reports, extract their text,
//! analyze them into structured findings, and poll the results.

mod analyzer;
mod auth;
mod chat;
mod config;
mod error;
mod extraction;
mod files;
mod ocr;
mod pipeline;
mod rate_limit;
mod report;
mod review;
mod store;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analyzer::Analyzer;
use auth::{AuthGate, AuthUser, JwksVerifier, TokenVerifier};
use chat::{ChatModel, HttpChatClient};
use config::Settings;
use error::AppError;
use extraction::{BatchItem, ExtractionService};
use ocr::http::HttpOcrClient;
use ocr::{DocumentOcr, ExtractedText};
use pipeline::{
    Pipeline, ProcessedDocumentResult, ProcessingMetadata, StatusView,
};
use rate_limit::RateLimiter;
use report::{Category, ProcessingStatus, ReadStatus, Report};
use review::Reviewer;
use store::{FileStore, ReportStore, RestStore};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    extraction: Arc<ExtractionService>,
    reports: Arc<dyn ReportStore>,
    files: Arc<dyn FileStore>,
    verifier: Arc<dyn TokenVerifier>,
    settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medreport_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let state = build_state(&settings)?;
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let http = reqwest::Client::new();

    let secrets = settings.secret_cache(&http);
    let ocr_key = settings.ocr_key(secrets.as_ref())?;
    let chat_key = settings.chat_key(secrets.as_ref())?;

    let ocr: Arc<dyn DocumentOcr> = Arc::new(HttpOcrClient::new(
        http.clone(),
        settings.ocr_api_url.clone(),
        ocr_key,
    ));
    let chat: Arc<dyn ChatModel> = Arc::new(HttpChatClient::new(
        http.clone(),
        settings.chat_api_url.clone(),
        settings.chat_model.clone(),
        chat_key,
    ));
    info!(
        "Collaborator clients initialized (ocr: {}, chat model: {})",
        settings.ocr_api_url, settings.chat_model
    );

    let rest = Arc::new(RestStore::new(
        http.clone(),
        settings.table_api_url.clone(),
        settings.table_service_key.clone(),
        settings.storage_bucket.clone(),
    ));
    let reports: Arc<dyn ReportStore> = rest.clone();
    let files: Arc<dyn FileStore> = rest;

    let ocr_limiter = Arc::new(Mutex::new(RateLimiter::per_minute(
        settings.ocr_requests_per_minute as usize,
    )));
    let chat_limiter = Arc::new(Mutex::new(RateLimiter::per_minute(
        settings.chat_requests_per_minute as usize,
    )));

    let extraction = Arc::new(ExtractionService::new(ocr, ocr_limiter));
    let analyzer = Analyzer::new(chat.clone(), chat_limiter.clone(), settings.chat_max_tokens);
    let reviewer = Reviewer::new(chat, chat_limiter, settings.chat_max_tokens);
    let pipeline = Arc::new(Pipeline::new(
        extraction.clone(),
        analyzer,
        reviewer,
        reports.clone(),
        files.clone(),
    ));

    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwksVerifier::new(
        http,
        settings.auth_jwks_url.clone(),
        settings.auth_issuer.clone(),
        settings.auth_audience.clone(),
    ));

    Ok(AppState {
        pipeline,
        extraction,
        reports,
        files,
        verifier,
        settings: Arc::new(settings.clone()),
    })
}

fn app_router(state: AppState) -> Router {
    let auth_gate = AuthGate {
        verifier: state.verifier.clone(),
    };

    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let protected = Router::new()
        .route("/document-processor/upload", post(upload_document))
        .route("/document-processor/process-file", post(process_file))
        .route(
            "/document-processor/report-status/:report_id",
            get(report_status),
        )
        .route("/document-processor/extract-batch", post(extract_batch))
        .route("/reports", get(list_reports))
        .route(
            "/reports/:report_id",
            get(get_report).patch(update_report).delete(delete_report),
        )
        .with_state(state)
        .layer(axum::middleware::from_fn(auth::require_auth))
        // Extension must be outermost so the middleware can extract AuthGate
        .layer(Extension(auth_gate));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Upload a document, store it, and process it.
///
/// With inline processing the full result comes back in this response;
/// otherwise the stored report row is returned and the client polls
/// `report-status` while a background task does the work.
async fn upload_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let started = std::time::Instant::now();
    let upload = read_file_field(multipart).await?;

    let kind = files::validate(&upload.bytes, &upload.mime_type)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    info!(
        "upload: {} ({}, {} bytes) from user {}",
        upload.file_name.as_deref().unwrap_or("unnamed"),
        kind.mime(),
        upload.bytes.len(),
        user.user_id
    );

    let title = upload.file_name.as_deref().unwrap_or("Medical report");
    let mut report = Report::new(&user.user_id, title);
    report.file_path = files::storage_path(&user.user_id, &report.id, &upload.bytes, kind);

    state
        .files
        .put(&report.file_path, upload.bytes.clone(), kind.mime())
        .await
        .map_err(|e| AppError::Internal(format!("cannot store document: {}", e)))?;
    state
        .reports
        .create(&report)
        .await
        .map_err(|e| AppError::Internal(format!("cannot create report: {}", e)))?;

    if state.settings.inline_processing {
        let doc = state
            .pipeline
            .process_upload(&mut report, &upload.bytes, kind.mime())
            .await?;
        let meta = ProcessingMetadata {
            processing_time_ms: started.elapsed().as_millis() as u64,
            file_type: kind.mime().to_string(),
            file_size: upload.bytes.len(),
        };
        let result =
            ProcessedDocumentResult::from_document(doc, meta, state.settings.debug_payloads);
        Ok(Json(result).into_response())
    } else {
        // Mark the report busy before handing it to the background task, so
        // a poller never observes `unprocessed` after this response.
        report.processing_status = ProcessingStatus::InProgress;
        report.touch();
        state
            .reports
            .update(&report)
            .await
            .map_err(|e| AppError::Internal(format!("cannot update report: {}", e)))?;
        state
            .pipeline
            .dispatch(report.id.clone(), user.user_id.clone());
        Ok(Json(report).into_response())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessFileRequest {
    report_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessFileResponse {
    success: bool,
    report_id: String,
    status: ProcessingStatus,
}

/// Kick off background processing of an already-stored report.
async fn process_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ProcessFileRequest>,
) -> Result<Json<ProcessFileResponse>, AppError> {
    let mut report = state
        .reports
        .fetch(&req.report_id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot load report: {}", e)))?
        .ok_or_else(|| AppError::NotFound(format!("report {} does not exist", req.report_id)))?;

    // A busy report is not re-dispatched; the request is an idempotent no-op.
    if state.pipeline.dispatcher.is_in_flight(&report.id)
        || report.processing_status == ProcessingStatus::InProgress
    {
        return Ok(Json(ProcessFileResponse {
            success: true,
            report_id: report.id,
            status: ProcessingStatus::InProgress,
        }));
    }

    report.processing_status = ProcessingStatus::InProgress;
    report.touch();
    state
        .reports
        .update(&report)
        .await
        .map_err(|e| AppError::Internal(format!("cannot update report: {}", e)))?;
    state
        .pipeline
        .dispatch(report.id.clone(), user.user_id.clone());

    Ok(Json(ProcessFileResponse {
        success: true,
        report_id: report.id,
        status: ProcessingStatus::InProgress,
    }))
}

/// Poll the processing status of a report.
async fn report_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    state
        .pipeline
        .report_status(&report_id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot load report: {}", e)))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("report {} does not exist", report_id)))
}

#[derive(Serialize)]
struct BatchResponse {
    results: Vec<ExtractedText>,
}

/// Extract text from up to ten documents in one request.
async fn extract_batch(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, AppError> {
    let mut items = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("multipart error: {}", e)))?
    {
        if field.name() != Some("files") && field.name() != Some("file") {
            continue;
        }
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read file: {}", e)))?
            .to_vec();
        items.push(BatchItem { bytes, mime_type });
    }

    if items.is_empty() {
        return Err(AppError::Validation("No files uploaded".to_string()));
    }

    let results = state
        .extraction
        .extract_batch(items, &user.user_id)
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(Json(BatchResponse { results }))
}

/// List the caller's reports, newest first.
async fn list_reports(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<Report>>, AppError> {
    state
        .reports
        .list(&user.user_id)
        .await
        .map(Json)
        .map_err(|e| AppError::Internal(format!("cannot list reports: {}", e)))
}

/// Get one report.
async fn get_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<String>,
) -> Result<Json<Report>, AppError> {
    state
        .reports
        .fetch(&report_id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot load report: {}", e)))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("report {} does not exist", report_id)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateReportRequest {
    title: Option<String>,
    category: Option<Category>,
    summary: Option<String>,
    status: Option<ReadStatus>,
}

/// Update user-editable report fields.
async fn update_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<String>,
    Json(req): Json<UpdateReportRequest>,
) -> Result<Json<Report>, AppError> {
    let mut report = state
        .reports
        .fetch(&report_id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot load report: {}", e)))?
        .ok_or_else(|| AppError::NotFound(format!("report {} does not exist", report_id)))?;

    if let Some(title) = req.title {
        if title.trim().is_empty() {
            return Err(AppError::Validation("title cannot be empty".to_string()));
        }
        report.title = title;
    }
    if let Some(category) = req.category {
        report.category = category;
    }
    if let Some(summary) = req.summary {
        report.summary = summary;
    }
    if let Some(status) = req.status {
        report.status = status;
    }
    report.touch();

    state
        .reports
        .update(&report)
        .await
        .map_err(|e| AppError::Internal(format!("cannot update report: {}", e)))?;
    Ok(Json(report))
}

/// Delete a report and its stored document.
async fn delete_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = state
        .reports
        .fetch(&report_id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot load report: {}", e)))?
        .ok_or_else(|| AppError::NotFound(format!("report {} does not exist", report_id)))?;

    state
        .reports
        .delete(&report.id, &user.user_id)
        .await
        .map_err(|e| AppError::Internal(format!("cannot delete report: {}", e)))?;

    // Object cleanup is best-effort; the row is already gone.
    if !report.file_path.is_empty() {
        if let Err(err) = state.files.delete(&report.file_path).await {
            warn!(
                "delete_report: could not remove stored object {}: {}",
                report.file_path, err
            );
        }
    }

    Ok(Json(serde_json::json!({ "success": true })))
}

// ============================================================================
// Helper functions
// ============================================================================

struct UploadedFile {
    bytes: Vec<u8>,
    mime_type: String,
    file_name: Option<String>,
}

/// Read the `file` part out of a multipart body.
async fn read_file_field(mut multipart: Multipart) -> Result<UploadedFile, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(|s| s.to_string());
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read file: {}", e)))?
            .to_vec();
        return Ok(UploadedFile {
            bytes,
            mime_type,
            file_name,
        });
    }
    Err(AppError::Validation("No file uploaded".to_string()))
}
