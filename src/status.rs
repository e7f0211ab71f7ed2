//! Dependency capability report.
//!
//! Startup readiness plus anything that has gone wrong since, such as a
//! warehouse token that stopped being accepted.

use serde::Serialize;

/// Capability report served by `GET /health` and printed by `dcx status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    /// `"ok"` when every dependency is up, `"degraded"` otherwise.
    pub status: String,
    pub version: String,
    pub llm: bool,
    pub warehouse: bool,
    /// Why the warehouse is failing authentication, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse_error: Option<String>,
    /// Remote object storage answered during startup.
    pub blob_storage: bool,
    pub router_model: String,
    pub answer_model: String,
    pub uploads_indexed: usize,
}

impl StatusReport {
    pub fn new(
        llm: bool,
        warehouse: bool,
        blob_storage: bool,
        router_model: String,
        answer_model: String,
        uploads_indexed: usize,
    ) -> Self {
        let status = if llm && warehouse && blob_storage {
            "ok"
        } else {
            "degraded"
        };
        Self {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            llm,
            warehouse,
            warehouse_error: None,
            blob_storage,
            router_model,
            answer_model,
            uploads_indexed,
        }
    }

    /// Mark the warehouse down with the reason it is failing.
    pub fn with_warehouse_error(mut self, error: Option<String>) -> Self {
        if let Some(error) = error {
            self.warehouse = false;
            self.warehouse_error = Some(error);
            self.status = "degraded".to_string();
        }
        self
    }

    /// Plain-text table for the terminal.
    pub fn render_table(&self) -> String {
        let state = |up: bool| if up { "OK" } else { "UNAVAILABLE" };
        let mut out = String::new();
        out.push_str(&format!("{:<16} {:<12} DETAIL\n", "DEPENDENCY", "STATUS"));
        out.push_str(&format!(
            "{:<16} {:<12} router={} answer={}\n",
            "llm",
            state(self.llm),
            self.router_model,
            self.answer_model
        ));
        out.push_str(&format!(
            "{:<16} {:<12} {}\n",
            "warehouse",
            state(self.warehouse),
            self.warehouse_error.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "{:<16} {:<12} {}\n",
            "blob_storage",
            state(self.blob_storage),
            if self.blob_storage { "remote" } else { "local fallback" }
        ));
        out.push_str(&format!(
            "{:<16} {:<12} {} indexed\n",
            "uploads", "OK", self.uploads_indexed
        ));
        out
    }
}
