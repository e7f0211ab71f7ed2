use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Chat-completions provider used by the router, the SQL generator and the
/// answer stage.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Fast, cheap model used for routing.
    #[serde(default = "default_router_model")]
    pub router_model: String,
    /// Model used for SQL generation and answers.
    #[serde(default = "default_answer_model")]
    pub answer_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            router_model: default_router_model(),
            answer_model: default_answer_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_router_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_answer_model() -> String {
    "gpt-4o".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default = "default_warehouse_provider")]
    pub provider: String,
    /// GCP project id. The warehouse is unavailable without one.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Service account key file. Falls back to `GOOGLE_APPLICATION_CREDENTIALS`,
    /// then to a fixed `BIGQUERY_ACCESS_TOKEN`.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_dry_run_timeout_secs")]
    pub dry_run_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            provider: default_warehouse_provider(),
            project: None,
            dataset: default_dataset(),
            location: None,
            credentials_file: None,
            dry_run_timeout_secs: default_dry_run_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl WarehouseConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled" && self.project.is_some()
    }
}

fn default_warehouse_provider() -> String {
    "bigquery".to_string()
}
fn default_dataset() -> String {
    "saasmetrics".to_string()
}
fn default_dry_run_timeout_secs() -> u64 {
    10
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_query_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default)]
    pub remote: Option<RemoteStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            remote: None,
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads_store")
}

/// S3-compatible bucket holding uploaded files.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteStorageConfig {
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_prefix() -> String {
    "uploads/".to_string()
}
fn default_region() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: default_max_upload_mb(),
            restore_timeout_secs: default_restore_timeout_secs(),
        }
    }
}

fn default_max_upload_mb() -> u64 {
    20
}
fn default_restore_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Turns of history given to the answer stage.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Turns of history given to the router and SQL generator.
    #[serde(default = "default_router_history_window")]
    pub router_history_window: usize,
    /// YAML/markdown column-disambiguation notes injected into prompts.
    #[serde(default)]
    pub data_dictionary: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            router_history_window: default_router_history_window(),
            data_dictionary: None,
        }
    }
}

fn default_history_window() -> usize {
    12
}
fn default_router_history_window() -> usize {
    4
}

/// Load and validate configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.uploads.max_upload_mb == 0 {
        anyhow::bail!("uploads.max_upload_mb must be > 0");
    }
    if config.warehouse.dry_run_timeout_secs == 0 || config.warehouse.probe_timeout_secs == 0 {
        anyhow::bail!("warehouse timeouts must be > 0");
    }
    if config.pipeline.history_window == 0 {
        anyhow::bail!("pipeline.history_window must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.warehouse.provider.as_str() {
        "disabled" | "bigquery" => {}
        other => anyhow::bail!(
            "Unknown warehouse provider: '{}'. Must be disabled or bigquery.",
            other
        ),
    }

    if let Some(remote) = &config.storage.remote {
        if remote.bucket.trim().is_empty() {
            anyhow::bail!("storage.remote.bucket must not be empty");
        }
        if !remote.prefix.is_empty() && !remote.prefix.ends_with('/') {
            anyhow::bail!("storage.remote.prefix must end with '/'");
        }
    }

    Ok(())
}
