//! Application context and startup phase.
//!
//! [`Backends`] holds the external collaborators (language model, warehouse,
//! blob stores). [`App::start`] turns them into a running service: it probes
//! the warehouse with a `SELECT 1` dry run and restores uploads from storage,
//! both concurrently and each under its own timeout, then wires the pipeline.
//! Whatever did not come up in time is reported as unavailable by
//! [`App::status`] instead of being retried in the background.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::answer::AnswerEngine;
use crate::blob_store::{BlobStore, LocalStore, RemoteStore};
use crate::config::Config;
use crate::llm::{create_model, DisabledModel, LanguageModel};
use crate::pipeline::Pipeline;
use crate::router::QueryRouter;
use crate::sql::SqlEngine;
use crate::status::StatusReport;
use crate::uploads::{RestoreReport, UploadIndex};
use crate::warehouse::{create_warehouse, schema_summary, DataDictionary, Warehouse};

/// External collaborators, before the startup phase.
pub struct Backends {
    pub model: Arc<dyn LanguageModel>,
    pub warehouse: Option<Arc<dyn Warehouse>>,
    pub remote: Option<Arc<dyn BlobStore>>,
    pub local: Arc<dyn BlobStore>,
    pub dictionary: Arc<DataDictionary>,
}

impl Backends {
    /// Build every backend named by `config`. Missing credentials disable the
    /// corresponding backend with a warning; only an unusable local upload
    /// directory is an error.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model: Arc<dyn LanguageModel> = match create_model(&config.llm) {
            Ok(model) => Arc::from(model),
            Err(e) => {
                warn!(error = %e, "language model unavailable");
                Arc::new(DisabledModel)
            }
        };

        let warehouse: Option<Arc<dyn Warehouse>> = match create_warehouse(&config.warehouse) {
            Ok(Some(bq)) => Some(Arc::new(bq)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "warehouse unavailable");
                None
            }
        };

        let remote: Option<Arc<dyn BlobStore>> = match &config.storage.remote {
            Some(remote) => match RemoteStore::from_env(remote) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, bucket = %remote.bucket, "remote storage unavailable");
                    None
                }
            },
            None => None,
        };

        let local = Arc::new(LocalStore::open(&config.storage.upload_dir)?);
        let dictionary = Arc::new(DataDictionary::new(config.pipeline.data_dictionary.clone()));

        Ok(Self {
            model,
            warehouse,
            remote,
            local,
            dictionary,
        })
    }
}

/// What the startup phase found.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub warehouse_ready: bool,
    pub remote_storage_ready: bool,
    /// `None` when restoration hit its timeout.
    pub restore: Option<RestoreReport>,
}

pub struct App {
    pub config: Config,
    pub uploads: Arc<UploadIndex>,
    pub pipeline: Arc<Pipeline>,
    pub dictionary: Arc<DataDictionary>,
    pub startup: StartupReport,
    model: Arc<dyn LanguageModel>,
    /// The configured warehouse, kept even when the startup probe failed so
    /// its authentication state can be reported.
    warehouse: Option<Arc<dyn Warehouse>>,
}

impl App {
    /// Run the startup phase and wire the pipeline.
    pub async fn start(config: Config, backends: Backends) -> Self {
        let Backends {
            model,
            warehouse,
            remote,
            local,
            dictionary,
        } = backends;

        let has_remote = remote.is_some();
        let uploads = Arc::new(UploadIndex::new(
            remote,
            local,
            config.uploads.max_upload_mb,
        ));

        let probe_timeout = Duration::from_secs(config.warehouse.probe_timeout_secs);
        let restore_timeout = Duration::from_secs(config.uploads.restore_timeout_secs);
        let (warehouse_ready, restore) = tokio::join!(
            async {
                match &warehouse {
                    Some(w) => probe_warehouse(w.as_ref(), probe_timeout).await,
                    None => false,
                }
            },
            async {
                match tokio::time::timeout(restore_timeout, uploads.restore_from_storage()).await {
                    Ok(report) => Some(report),
                    Err(_) => {
                        warn!(timeout = ?restore_timeout, "upload restoration timed out");
                        None
                    }
                }
            }
        );

        if let Some(report) = &restore {
            info!(
                remote = report.restored_remote,
                local = report.restored_local,
                failed = report.failed,
                "uploads restored"
            );
        }

        let remote_storage_ready =
            has_remote && restore.as_ref().is_some_and(|r| r.remote_reachable);

        let configured_warehouse = warehouse.clone();
        let warehouse = if warehouse_ready { warehouse } else { None };
        let schema = schema_summary(
            config.warehouse.project.as_deref().unwrap_or("YOUR_PROJECT"),
            &config.warehouse.dataset,
        );

        let router = QueryRouter::new(
            model.clone(),
            uploads.clone(),
            schema.clone(),
            config.pipeline.router_history_window,
        );
        let sql = SqlEngine::new(
            model.clone(),
            warehouse,
            dictionary.clone(),
            schema,
            config.pipeline.router_history_window,
            Duration::from_secs(config.warehouse.dry_run_timeout_secs),
        );
        let answer = AnswerEngine::new(
            model.clone(),
            dictionary.clone(),
            config.pipeline.history_window,
        );
        let pipeline = Arc::new(Pipeline::new(
            router,
            sql,
            answer,
            uploads.clone(),
            config.warehouse.dataset.clone(),
        ));

        info!(
            llm = model.is_available(),
            warehouse = warehouse_ready,
            remote_storage = remote_storage_ready,
            uploads = uploads.len().await,
            "startup complete"
        );

        Self {
            config,
            uploads,
            pipeline,
            dictionary,
            startup: StartupReport {
                warehouse_ready,
                remote_storage_ready,
                restore,
            },
            model,
            warehouse: configured_warehouse,
        }
    }

    /// Capability report for `/health` and `dcx status`.
    pub async fn status(&self) -> StatusReport {
        let warehouse_error = match &self.warehouse {
            Some(warehouse) => warehouse.auth_failure().await,
            None => None,
        };
        StatusReport::new(
            self.model.is_available(),
            self.startup.warehouse_ready,
            self.startup.remote_storage_ready,
            self.config.llm.router_model.clone(),
            self.config.llm.answer_model.clone(),
            self.uploads.len().await,
        )
        .with_warehouse_error(warehouse_error)
    }
}

async fn probe_warehouse(warehouse: &dyn Warehouse, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, warehouse.dry_run("SELECT 1")).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "warehouse probe failed");
            false
        }
        Err(_) => {
            warn!(timeout = ?timeout, "warehouse probe timed out");
            false
        }
    }
}
