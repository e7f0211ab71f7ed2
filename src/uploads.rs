//! Shared index of uploaded documents.
//!
//! The [`UploadIndex`] owns every parsed upload for the process. Reads
//! (`combined_text`, `counted_text`, `manifest`) take a shared lock; every
//! mutation (upload, index, remove, restore) first takes an async write gate
//! so that storage and the in-memory list change together and in a single
//! order. Two racing operations on the same filename therefore resolve
//! deterministically: the one that takes the gate last wins, and its entry
//! carries the higher `version`.
//!
//! Bytes are persisted to the remote [`BlobStore`] when one is configured and
//! to the local directory otherwise (or when the remote write fails). On
//! startup [`UploadIndex::restore_from_storage`] re-parses whatever is found
//! there.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::extract::{parse_labelled, ALLOWED_EXTENSIONS};
use crate::models::{extension_of, SourceType, StorageLocation, UploadEntry, UploadSummary};

/// Number of characters kept in an entry's preview.
pub const PREVIEW_CHARS: usize = 200;

const BANNER: &str = "==================================================";

/// Errors surfaced to the uploader.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Unsupported type{}. Allowed: {}", extension_note(.extension), ALLOWED_EXTENSIONS.join(", "))]
    UnsupportedType { extension: Option<String> },

    #[error("File too large ({size_mb:.1} MB). Max: {max_mb} MB.")]
    FileTooLarge { size_mb: f64, max_mb: u64 },

    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("File not found in index: {0}")]
    NotFound(String),

    #[error("Could not store {filename}: {message}")]
    Storage { filename: String, message: String },
}

fn extension_note(extension: &Option<String>) -> String {
    extension
        .as_deref()
        .map(|e| format!(" (.{})", e))
        .unwrap_or_default()
}

/// Outcome of a startup restoration pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Whether the remote store answered its listing call.
    pub remote_reachable: bool,
    pub restored_remote: usize,
    pub restored_local: usize,
    pub failed: usize,
}

impl RestoreReport {
    pub fn restored(&self) -> usize {
        self.restored_remote + self.restored_local
    }
}

/// Reject unknown extensions and files above `max_mb`.
pub fn validate_upload(filename: &str, len: usize, max_mb: u64) -> Result<(), UploadError> {
    if SourceType::from_filename(filename).is_none() {
        return Err(UploadError::UnsupportedType {
            extension: extension_of(filename),
        });
    }
    check_size(len, max_mb)
}

pub fn check_size(len: usize, max_mb: u64) -> Result<(), UploadError> {
    let size_mb = len as f64 / (1024.0 * 1024.0);
    if size_mb > max_mb as f64 {
        return Err(UploadError::FileTooLarge { size_mb, max_mb });
    }
    Ok(())
}

/// Basename of `filename` with spaces replaced by underscores.
pub fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .replace(' ', "_");
    if base.is_empty() || base == "." || base == ".." {
        return Err(UploadError::InvalidFilename(filename.to_string()));
    }
    Ok(base)
}

fn preview_of(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn size_kb(len: usize) -> f64 {
    (len as f64 / 1024.0 * 10.0).round() / 10.0
}

pub struct UploadIndex {
    entries: RwLock<Vec<UploadEntry>>,
    write_gate: Mutex<()>,
    next_version: AtomicU64,
    remote: Option<Arc<dyn BlobStore>>,
    local: Arc<dyn BlobStore>,
    max_upload_mb: u64,
}

impl UploadIndex {
    pub fn new(
        remote: Option<Arc<dyn BlobStore>>,
        local: Arc<dyn BlobStore>,
        max_upload_mb: u64,
    ) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            write_gate: Mutex::new(()),
            next_version: AtomicU64::new(1),
            remote,
            local,
            max_upload_mb,
        }
    }

    pub fn max_upload_mb(&self) -> u64 {
        self.max_upload_mb
    }

    /// Parse `content` and insert it, replacing any entry with the same name.
    pub async fn index(
        &self,
        filename: &str,
        content: &[u8],
        storage: StorageLocation,
    ) -> UploadEntry {
        let _gate = self.write_gate.lock().await;
        self.insert(filename, content, storage).await
    }

    /// Caller must hold the write gate.
    async fn insert(&self, filename: &str, content: &[u8], storage: StorageLocation) -> UploadEntry {
        let source_type = SourceType::detect(filename);
        let type_label = source_type.label();
        let label = format!("Uploaded {}: {}", type_label, filename);

        let name = filename.to_string();
        let bytes = content.to_vec();
        let text = match tokio::task::spawn_blocking(move || parse_labelled(&name, &bytes, &label))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(filename, error = %e, "parser task failed");
                format!("[Could not parse {}: {}]", type_label, e)
            }
        };

        let entry = UploadEntry {
            filename: filename.to_string(),
            source_type,
            preview: preview_of(&text),
            text,
            size_kb: size_kb(content.len()),
            uploaded_at: Utc::now(),
            storage,
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
        };

        let mut entries = self.entries.write().await;
        entries.retain(|e| e.filename != filename);
        entries.push(entry.clone());
        debug!(filename, version = entry.version, "indexed upload");
        entry
    }

    /// Validate, persist and index an uploaded file.
    ///
    /// The bytes go to remote storage when available; a missing or failing
    /// remote falls back to the local directory.
    pub async fn upload(&self, filename: &str, content: &[u8]) -> Result<UploadEntry, UploadError> {
        validate_upload(filename, content.len(), self.max_upload_mb)?;
        let safe_name = sanitize_filename(filename)?;

        let _gate = self.write_gate.lock().await;

        let mut storage = StorageLocation::Local;
        if let Some(remote) = &self.remote {
            match remote.put(&safe_name, content).await {
                Ok(()) => storage = StorageLocation::Remote,
                Err(e) => warn!(filename = %safe_name, error = %e, "remote upload failed, using local storage"),
            }
        }
        if storage == StorageLocation::Local {
            self.local
                .put(&safe_name, content)
                .await
                .map_err(|e| UploadError::Storage {
                    filename: safe_name.clone(),
                    message: format!("{:#}", e),
                })?;
        }

        let entry = self.insert(&safe_name, content, storage).await;
        info!(filename = %entry.filename, source_type = %entry.source_type, storage = %entry.storage, size_kb = entry.size_kb, "upload indexed");
        Ok(entry)
    }

    /// Remove `filename` from the index, then delete it from both stores.
    /// Storage errors are logged and ignored; the index is authoritative.
    pub async fn remove(&self, filename: &str) -> Result<(), UploadError> {
        let _gate = self.write_gate.lock().await;

        {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.filename != filename);
            if entries.len() == before {
                return Err(UploadError::NotFound(filename.to_string()));
            }
        }

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(filename).await {
                warn!(filename, error = %e, "remote delete failed");
            }
        }
        if let Err(e) = self.local.delete(filename).await {
            warn!(filename, error = %e, "local delete failed");
        }
        info!(filename, "upload removed");
        Ok(())
    }

    /// Re-index files found in remote storage, then the local directory.
    /// Anything already indexed is skipped; individual failures are logged.
    pub async fn restore_from_storage(&self) -> RestoreReport {
        let _gate = self.write_gate.lock().await;
        let mut report = RestoreReport::default();
        let mut indexed: HashSet<String> = self
            .entries
            .read()
            .await
            .iter()
            .map(|e| e.filename.clone())
            .collect();

        let mut stores: Vec<(&Arc<dyn BlobStore>, StorageLocation)> = Vec::new();
        if let Some(remote) = &self.remote {
            stores.push((remote, StorageLocation::Remote));
        }
        stores.push((&self.local, StorageLocation::Local));

        for (store, location) in stores {
            let names = match store.list().await {
                Ok(names) => {
                    if location == StorageLocation::Remote {
                        report.remote_reachable = true;
                    }
                    names
                }
                Err(e) => {
                    warn!(store = store.name(), error = %e, "could not list stored uploads");
                    report.failed += 1;
                    continue;
                }
            };

            for name in names {
                if SourceType::from_filename(&name).is_none() || indexed.contains(&name) {
                    continue;
                }
                match store.get(&name).await {
                    Ok(bytes) => {
                        self.insert(&name, &bytes, location).await;
                        indexed.insert(name);
                        match location {
                            StorageLocation::Remote => report.restored_remote += 1,
                            StorageLocation::Local => report.restored_local += 1,
                        }
                    }
                    Err(e) => {
                        warn!(store = store.name(), filename = %name, error = %e, "could not fetch stored upload");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Every entry's text under a `SOURCE: Uploaded <type> — <filename>`
    /// banner. Empty when nothing is indexed.
    pub async fn combined_text(&self) -> String {
        combine(&self.entries.read().await)
    }

    /// Entry count and combined text taken from the same snapshot.
    pub async fn counted_text(&self) -> (usize, String) {
        let entries = self.entries.read().await;
        (entries.len(), combine(&entries))
    }

    pub async fn manifest(&self) -> Vec<UploadSummary> {
        self.entries.read().await.iter().map(UploadSummary::from).collect()
    }

    /// `[{"filename", "source_type"}]` JSON for the router prompt.
    pub async fn routing_manifest(&self) -> String {
        let rows: Vec<serde_json::Value> = self
            .entries
            .read()
            .await
            .iter()
            .map(|e| serde_json::json!({ "filename": e.filename, "source_type": e.source_type }))
            .collect();
        serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    pub async fn get(&self, filename: &str) -> Option<UploadEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.filename == filename)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn combine(entries: &[UploadEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{BANNER}\nSOURCE: Uploaded {} — {}\n{BANNER}\n{}",
                e.source_type, e.filename, e.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
