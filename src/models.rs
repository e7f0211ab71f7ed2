//! Core data models used throughout data-concierge.
//!
//! These types describe the uploads held by the index, the per-question
//! routing and SQL results that flow through the pipeline, the conversation
//! turns supplied by the client, and the events streamed back to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============ Uploads ============

/// Format family of an uploaded file, detected from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "Excel")]
    Spreadsheet,
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "Word")]
    WordDoc,
    #[serde(rename = "CSV")]
    Csv,
    /// Indexed under an extension no parser handles.
    Unknown,
}

impl SourceType {
    /// Detect the source type from a filename's extension (case-insensitive).
    pub fn from_filename(filename: &str) -> Option<Self> {
        match extension_of(filename).as_deref() {
            Some("xlsx" | "xls") => Some(SourceType::Spreadsheet),
            Some("pdf") => Some(SourceType::Pdf),
            Some("docx") => Some(SourceType::WordDoc),
            Some("csv") => Some(SourceType::Csv),
            _ => None,
        }
    }

    /// Like [`from_filename`](Self::from_filename) but never fails.
    pub fn detect(filename: &str) -> Self {
        Self::from_filename(filename).unwrap_or(SourceType::Unknown)
    }

    /// Human-readable label used in prompt banners and parser headers.
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Spreadsheet => "Excel",
            SourceType::Pdf => "PDF",
            SourceType::WordDoc => "Word",
            SourceType::Csv => "CSV",
            SourceType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lowercased extension of `filename` without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Where an upload's bytes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    /// Remote object storage bucket.
    Remote,
    /// Local fallback directory.
    Local,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Remote => f.write_str("remote"),
            StorageLocation::Local => f.write_str("local"),
        }
    }
}

/// A parsed upload held by the [`UploadIndex`](crate::uploads::UploadIndex).
#[derive(Debug, Clone, Serialize)]
pub struct UploadEntry {
    pub filename: String,
    pub source_type: SourceType,
    pub text: String,
    pub preview: String,
    pub size_kb: f64,
    pub uploaded_at: DateTime<Utc>,
    pub storage: StorageLocation,
    /// Insertion order stamp; a re-upload always carries a higher version.
    pub version: u64,
}

/// Manifest row: an [`UploadEntry`] without its extracted text.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadSummary {
    pub filename: String,
    pub source_type: SourceType,
    pub preview: String,
    pub size_kb: f64,
    pub uploaded_at: DateTime<Utc>,
    pub storage: StorageLocation,
}

impl From<&UploadEntry> for UploadSummary {
    fn from(entry: &UploadEntry) -> Self {
        Self {
            filename: entry.filename.clone(),
            source_type: entry.source_type,
            preview: entry.preview.clone(),
            size_kb: entry.size_kb,
            uploaded_at: entry.uploaded_at,
            storage: entry.storage,
        }
    }
}

// ============ Conversation ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of client-held conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Rendering metadata (citations, confidence, routing) echoed by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: None,
        }
    }
}

/// Render the trailing `window` turns as `User: …` / `Assistant: …` lines,
/// or `(none)` when there is no history.
pub fn format_history(history: &[ConversationTurn], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    let text = history[start..]
        .iter()
        .map(|turn| {
            let who = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", who, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        "(none)".to_string()
    } else {
        text
    }
}

// ============ Routing ============

/// A data source the router can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "bigquery", alias = "warehouse")]
    Warehouse,
    #[serde(rename = "uploaded", alias = "uploads")]
    Uploads,
}

impl DataSource {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DataSource::Warehouse => "bigquery",
            DataSource::Uploads => "uploaded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    MultiSource,
    Followup,
    UploadOnly,
    #[default]
    #[serde(other)]
    SingleSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntentTag {
    Revenue,
    Pipeline,
    Churn,
    Policy,
    Pricing,
    AccountHealth,
    Usage,
    SavePlaybook,
    Comparison,
    #[default]
    #[serde(other)]
    Other,
}

/// The router's per-question decision. Produced once, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub sources: Vec<DataSource>,
    pub needs_sql: bool,
    pub sql_intent: String,
    pub query_type: QueryType,
    pub intent_tag: IntentTag,
    pub reasoning: String,
}

impl RoutingDecision {
    /// Default decision used whenever the router model cannot be consulted
    /// or its answer cannot be decoded.
    pub fn fallback(question: &str, cause: impl std::fmt::Display) -> Self {
        Self {
            sources: vec![DataSource::Warehouse],
            needs_sql: true,
            sql_intent: question.to_string(),
            query_type: QueryType::SingleSource,
            intent_tag: IntentTag::Other,
            reasoning: format!("router fallback: {}", cause),
        }
    }

    pub fn uses(&self, source: DataSource) -> bool {
        self.sources.contains(&source)
    }
}

// ============ SQL ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlStatus {
    Success,
    NotNeeded,
    ValidationFailed,
    ExecError,
    GenError,
    Unavailable,
}

/// Terminal state of the SQL engine for one question.
#[derive(Debug, Clone, Serialize)]
pub struct SqlOutcome {
    pub status: SqlStatus,
    /// Final query text; for `success` it is the text the dry run accepted.
    pub sql: Option<String>,
    /// Rendered result rows, or the offline fallback dataset.
    pub data: String,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the single correction round ran.
    pub corrected: bool,
}

// ============ Answer ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[serde(alias = "HIGH", alias = "High")]
    High,
    #[serde(alias = "MEDIUM", alias = "Medium")]
    Medium,
    #[serde(alias = "LOW", alias = "Low")]
    Low,
}

/// Structured trailer of a streamed answer. Every field has a default so an
/// absent or partial trailer still decodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    #[serde(default)]
    pub sources_used: Vec<String>,
    #[serde(default)]
    pub disambiguation_notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_tag: Option<String>,
}

// ============ Stream protocol ============

/// One event of the `/query` stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueryEvent {
    Routing {
        sources: Vec<DataSource>,
        query_type: QueryType,
        intent_tag: IntentTag,
        reasoning: String,
    },
    Sql {
        sql: Option<String>,
        status: SqlStatus,
    },
    Token {
        token: String,
    },
    Done {
        done: bool,
        metadata: AnswerMetadata,
    },
}

impl QueryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::Routing { .. } => "routing",
            QueryEvent::Sql { .. } => "sql",
            QueryEvent::Token { .. } => "token",
            QueryEvent::Done { .. } => "done",
        }
    }

    pub fn token(text: impl Into<String>) -> Self {
        QueryEvent::Token { token: text.into() }
    }

    pub fn done(metadata: AnswerMetadata) -> Self {
        QueryEvent::Done {
            done: true,
            metadata,
        }
    }
}
