//! Persistence for report rows and uploaded documents.
//!
//! Production talks to a PostgREST-style table service and its companion
//! object storage over HTTP. Tests swap in the in-memory stores below.

use crate::error::UpstreamError;
use crate::report::Report;
use tracing::debug;

#[async_trait::async_trait]
pub trait ReportStore: Send + Sync {
    async fn create(&self, report: &Report) -> Result<(), UpstreamError>;
    /// Fetch scoped to the owning user; other users' rows are invisible.
    async fn fetch(&self, id: &str, user_id: &str) -> Result<Option<Report>, UpstreamError>;
    async fn update(&self, report: &Report) -> Result<(), UpstreamError>;
    async fn delete(&self, id: &str, user_id: &str) -> Result<(), UpstreamError>;
    async fn list(&self, user_id: &str) -> Result<Vec<Report>, UpstreamError>;
}

#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), UpstreamError>;
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpstreamError>;
    async fn delete(&self, path: &str) -> Result<(), UpstreamError>;
}

// ============================================================================
// REST-backed store
// ============================================================================

/// Client for the table service (`/rest/v1`) and object storage
/// (`/storage/v1`). One service key covers both.
#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl RestStore {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        service_key: String,
        bucket: String,
    ) -> Self {
        Self {
            client,
            base_url,
            service_key,
            bucket,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/rest/v1/{}", self.base_url, path);
        let resp = self.authed(self.client.get(&url)).send().await?;
        let resp = check(resp).await?;
        resp.json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(UpstreamError::from_response(status, body))
}

#[async_trait::async_trait]
impl ReportStore for RestStore {
    async fn create(&self, report: &Report) -> Result<(), UpstreamError> {
        debug!("RestStore: inserting report {}", report.id);
        let url = format!("{}/rest/v1/reports", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .header("Prefer", "return=minimal")
            .json(report)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn fetch(&self, id: &str, user_id: &str) -> Result<Option<Report>, UpstreamError> {
        let rows: Vec<Report> = self
            .get_json(&format!("reports?id=eq.{}&userId=eq.{}&select=*", id, user_id))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update(&self, report: &Report) -> Result<(), UpstreamError> {
        debug!(
            "RestStore: updating report {} (processing_status={})",
            report.id, report.processing_status
        );
        let url = format!(
            "{}/rest/v1/reports?id=eq.{}&userId=eq.{}",
            self.base_url, report.id, report.user_id
        );
        let resp = self
            .authed(self.client.patch(&url))
            .header("Prefer", "return=minimal")
            .json(report)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, user_id: &str) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/rest/v1/reports?id=eq.{}&userId=eq.{}",
            self.base_url, id, user_id
        );
        let resp = self.authed(self.client.delete(&url)).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Report>, UpstreamError> {
        self.get_json(&format!(
            "reports?userId=eq.{}&select=*&order=createdAt.desc",
            user_id
        ))
        .await
    }
}

#[async_trait::async_trait]
impl FileStore for RestStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), UpstreamError> {
        debug!("RestStore: storing object {} ({} bytes)", path, bytes.len());
        let resp = self
            .authed(self.client.post(self.object_url(path)))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpstreamError> {
        let resp = self.authed(self.client.get(self.object_url(path))).send().await?;
        let resp = check(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, path: &str) -> Result<(), UpstreamError> {
        let resp = self
            .authed(self.client.delete(self.object_url(path)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory stores (tests)
// ============================================================================

#[cfg(test)]
pub use memory::{MemoryFileStore, MemoryReportStore};

#[cfg(test)]
mod memory {
    use super::*;
    use crate::report::ProcessingStatus;
    use std::collections::HashMap;
    use std::sync::{Mutex, RwLock};

    /// Map-backed [`ReportStore`] that records every processing-status write,
    /// so tests can assert on status transitions.
    #[derive(Default)]
    pub struct MemoryReportStore {
        rows: RwLock<HashMap<String, Report>>,
        pub status_log: Mutex<Vec<ProcessingStatus>>,
    }

    #[async_trait::async_trait]
    impl ReportStore for MemoryReportStore {
        async fn create(&self, report: &Report) -> Result<(), UpstreamError> {
            self.status_log.lock().unwrap().push(report.processing_status);
            self.rows
                .write()
                .unwrap()
                .insert(report.id.clone(), report.clone());
            Ok(())
        }

        async fn fetch(&self, id: &str, user_id: &str) -> Result<Option<Report>, UpstreamError> {
            Ok(self
                .rows
                .read()
                .unwrap()
                .get(id)
                .filter(|r| r.user_id == user_id)
                .cloned())
        }

        async fn update(&self, report: &Report) -> Result<(), UpstreamError> {
            self.status_log.lock().unwrap().push(report.processing_status);
            self.rows
                .write()
                .unwrap()
                .insert(report.id.clone(), report.clone());
            Ok(())
        }

        async fn delete(&self, id: &str, user_id: &str) -> Result<(), UpstreamError> {
            let mut rows = self.rows.write().unwrap();
            if rows.get(id).map(|r| r.user_id == user_id).unwrap_or(false) {
                rows.remove(id);
            }
            Ok(())
        }

        async fn list(&self, user_id: &str) -> Result<Vec<Report>, UpstreamError> {
            let mut out: Vec<Report> = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(out)
        }
    }

    #[derive(Default)]
    pub struct MemoryFileStore {
        objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    }

    #[async_trait::async_trait]
    impl FileStore for MemoryFileStore {
        async fn put(
            &self,
            path: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<(), UpstreamError> {
            self.objects
                .lock()
                .unwrap()
                .insert(path.to_string(), (bytes, content_type.to_string()));
            Ok(())
        }

        async fn fetch(&self, path: &str) -> Result<Vec<u8>, UpstreamError> {
            self.objects
                .lock()
                .unwrap()
                .get(path)
                .map(|(bytes, _)| bytes.clone())
                .ok_or_else(|| UpstreamError::Http {
                    status: 404,
                    body: format!("object not found: {}", path),
                })
        }

        async fn delete(&self, path: &str) -> Result<(), UpstreamError> {
            self.objects.lock().unwrap().remove(path);
            Ok(())
        }
    }
}
