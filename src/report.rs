#![allow(dead_code)]
//! Report domain model: the persisted record for one uploaded lab document,
//! its lab values, and the structured analysis produced by the chat
//! collaborator.
//!
//! All API-facing structs serialize in camelCase to match the mobile client's
//! wire contract.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle state of background analysis for a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unprocessed,
    InProgress,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Unprocessed => "unprocessed",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unprocessed" => Some(Self::Unprocessed),
            "in_progress" => Some(Self::InProgress),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the owning user has opened the report yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Unread,
    Read,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unread => "unread",
            ReadStatus::Read => "read",
        }
    }
}

/// Report category taxonomy. The analysis prompt instructs the model to pick
/// exactly one of these; anything else fails schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Brain,
    Heart,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Brain => "brain",
            Category::Heart => "heart",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "general" => Some(Self::General),
            "brain" => Some(Self::Brain),
            "heart" => Some(Self::Heart),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpretation of a single lab measurement against its reference range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Normal,
    High,
    Low,
}

// ============================================================================
// Records
// ============================================================================

/// One extracted laboratory measurement with interpretation metadata.
/// Owned by exactly one report; the set is replaced wholesale on each
/// successful re-analysis, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabValue {
    pub name: String,
    pub value: String,
    pub unit: String,
    pub normal_range: String,
    pub status: LabStatus,
    pub is_critical: bool,
    pub conclusion: String,
    pub suggestions: String,
}

/// The persisted record representing one uploaded document and its
/// derived analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub category: Category,
    pub summary: String,
    pub confidence: f64,
    #[serde(default)]
    pub lab_values: Vec<LabValue>,
    pub processing_status: ProcessingStatus,
    pub status: ReadStatus,
    pub file_path: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_message: Option<String>,
}

impl Report {
    /// Fresh report in the `unprocessed` state, created at upload time.
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            category: Category::General,
            summary: String::new(),
            confidence: 0.0,
            lab_values: Vec::new(),
            processing_status: ProcessingStatus::Unprocessed,
            status: ReadStatus::Unread,
            file_path: String::new(),
            created_at: now.clone(),
            updated_at: now,
            debug_message: None,
        }
    }

    /// Refresh `updated_at`; call on every mutation before persisting.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }
}

// ============================================================================
// Analysis contract
// ============================================================================

/// Structured output of the chat collaborator, transient until merged into a
/// report. Deserialization is the schema gate: missing or mistyped fields
/// fail the document rather than being accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalAnalysis {
    pub title: String,
    pub category: Category,
    pub lab_values: Vec<LabValue>,
    pub diagnoses: Vec<Diagnosis>,
    pub metadata: AnalysisMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub condition: String,
    pub details: String,
    pub recommendations: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    pub is_medical_report: bool,
    pub confidence: f64,
    pub missing_information: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_status_round_trips() {
        for status in [
            ProcessingStatus::Unprocessed,
            ProcessingStatus::InProgress,
            ProcessingStatus::Processed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(ProcessingStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::from_str("done"), None);
    }

    #[test]
    fn processing_status_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessingStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: ProcessingStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ProcessingStatus::Failed);
    }

    #[test]
    fn terminal_states() {
        assert!(!ProcessingStatus::Unprocessed.is_terminal());
        assert!(!ProcessingStatus::InProgress.is_terminal());
        assert!(ProcessingStatus::Processed.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
    }

    #[test]
    fn category_rejects_unknown_variant() {
        assert_eq!(Category::from_str("heart"), Some(Category::Heart));
        assert_eq!(Category::from_str("liver"), None);
        assert!(serde_json::from_str::<Category>("\"liver\"").is_err());
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = Report::new("user-1", "Blood panel");
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["processingStatus"], "unprocessed");
        assert_eq!(json["status"], "unread");
        assert!(json.get("labValues").is_some());
        // debugMessage is omitted until a failure populates it
        assert!(json.get("debugMessage").is_none());
    }

    #[test]
    fn report_debug_message_appears_on_failure() {
        let mut report = Report::new("user-1", "Blood panel");
        report.processing_status = ProcessingStatus::Failed;
        report.debug_message = Some("extraction returned no text".into());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["processingStatus"], "failed");
        assert_eq!(json["debugMessage"], "extraction returned no text");
    }

    #[test]
    fn lab_value_wire_shape() {
        let lab = LabValue {
            name: "Hemoglobin".into(),
            value: "14.2".into(),
            unit: "g/dL".into(),
            normal_range: "13.5-17.5".into(),
            status: LabStatus::Normal,
            is_critical: false,
            conclusion: "Within range".into(),
            suggestions: "None".into(),
        };
        let json = serde_json::to_value(&lab).unwrap();
        assert_eq!(json["normalRange"], "13.5-17.5");
        assert_eq!(json["isCritical"], false);
        assert_eq!(json["status"], "normal");
    }

    #[test]
    fn touch_updates_timestamp() {
        let mut report = Report::new("user-1", "Blood panel");
        report.updated_at = "2020-01-01T00:00:00+00:00".into();
        report.touch();
        assert_ne!(report.updated_at, "2020-01-01T00:00:00+00:00");
    }
}
