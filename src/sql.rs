//! Stage 2a: SQL generation, validation and bounded execution.
//!
//! ```text
//! start ─▶ generate ─┬─▶ (not_needed)             model answered NO_SQL_NEEDED
//!                    ├─▶ (gen_error)              generation call failed
//!                    └─▶ dry_run ─┬─▶ execute ─┬─▶ (success)
//!                                 │            └─▶ (exec_error)
//!                                 └─▶ correct ─▶ dry_run ─┬─▶ execute …
//!                                                         └─▶ (validation_failed)
//! ```
//!
//! `(unavailable)` is returned up front when the model or the warehouse is
//! missing. Exactly one correction round is attempted, whatever the dry-run
//! error was. Every outcome except `success` and `not_needed` carries the
//! offline fallback dataset.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::llm::{ChatRequest, LanguageModel, ModelTier};
use crate::models::{format_history, ConversationTurn, SqlOutcome, SqlStatus};
use crate::router::strip_fences;
use crate::warehouse::{fallback_dataset, render_rows, DataDictionary, Warehouse};

/// Upper bound on rows returned by any executed query.
pub const MAX_ROWS: usize = 500;

/// Reply meaning the question cannot be answered with SQL.
pub const NO_SQL_SENTINEL: &str = "NO_SQL_NEEDED";

const SQL_PROMPT: &str = "You are a BigQuery SQL expert.

Schema:
{schema}

Data dictionary (use it to resolve ambiguous columns):
{data_dict}

Conversation history:
{history}

SQL intent from the router: {sql_intent}
User question: {question}

Write one BigQuery SQL query. Rules:
- Use fully qualified table names: `{project}.{dataset}.TABLE`
- Select identifying columns (name, customer_id) along with any metric, never a lone metric column
- Use only columns present in the schema
- When choosing between ambiguous columns, add a comment: -- using X not Y because reason
- Return at most 500 rows
- If SQL cannot answer the question, reply exactly: NO_SQL_NEEDED

Reply with the SQL or NO_SQL_NEEDED only. No markdown fences, no explanation.";

/// Wrap a validated query so execution never returns more than [`MAX_ROWS`].
pub fn bound_query(sql: &str) -> String {
    format!("SELECT * FROM ({}) LIMIT {}", sql, MAX_ROWS)
}

/// Strip fences, whitespace and trailing semicolons from a model reply.
pub fn clean_sql(raw: &str) -> String {
    strip_fences(raw).trim_end_matches(';').trim().to_string()
}

fn correction_prompt(sql: &str, error: &str) -> String {
    format!(
        "Fix this BigQuery SQL. Reply with the corrected SQL only, no markdown, no explanation.\n\nSQL:\n{}\n\nError:\n{}",
        sql, error
    )
}

pub struct SqlEngine {
    model: Arc<dyn LanguageModel>,
    warehouse: Option<Arc<dyn Warehouse>>,
    dictionary: Arc<DataDictionary>,
    schema: String,
    history_window: usize,
    dry_run_timeout: Duration,
}

impl SqlEngine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        warehouse: Option<Arc<dyn Warehouse>>,
        dictionary: Arc<DataDictionary>,
        schema: String,
        history_window: usize,
        dry_run_timeout: Duration,
    ) -> Self {
        Self {
            model,
            warehouse,
            dictionary,
            schema,
            history_window,
            dry_run_timeout,
        }
    }

    pub async fn generate_and_run(
        &self,
        question: &str,
        sql_intent: &str,
        history: &[ConversationTurn],
    ) -> SqlOutcome {
        let warehouse = match &self.warehouse {
            Some(warehouse) if self.model.is_available() => warehouse,
            _ => return fallback_outcome(SqlStatus::Unavailable, None, None, false),
        };

        let prompt = SQL_PROMPT
            .replace("{schema}", &self.schema)
            .replace("{data_dict}", &self.dictionary.text().await)
            .replace("{history}", &format_history(history, self.history_window))
            .replace("{sql_intent}", sql_intent)
            .replace("{question}", question)
            .replace("{project}", warehouse.project())
            .replace("{dataset}", warehouse.dataset());

        let sql = match self
            .model
            .complete(ChatRequest::new(ModelTier::Answer, prompt))
            .await
        {
            Ok(raw) => clean_sql(&raw),
            Err(e) => {
                warn!(error = %e, "SQL generation failed");
                return fallback_outcome(SqlStatus::GenError, None, Some(e.to_string()), false);
            }
        };

        if sql == NO_SQL_SENTINEL {
            return SqlOutcome {
                status: SqlStatus::NotNeeded,
                sql: None,
                data: String::new(),
                row_count: 0,
                error: None,
                corrected: false,
            };
        }
        if sql.is_empty() {
            return fallback_outcome(
                SqlStatus::GenError,
                None,
                Some("model returned no SQL".to_string()),
                false,
            );
        }

        let outcome = self.validate_and_execute(warehouse.as_ref(), sql).await;
        info!(
            status = ?outcome.status,
            rows = outcome.row_count,
            corrected = outcome.corrected,
            "SQL stage finished"
        );
        outcome
    }

    async fn validate_and_execute(&self, warehouse: &dyn Warehouse, mut sql: String) -> SqlOutcome {
        let mut corrected = false;

        if let Err(first) = self.dry_run(warehouse, &sql).await {
            warn!(error = %first, "dry run failed, asking for one correction");
            corrected = true;

            let fix = ChatRequest::new(ModelTier::Answer, correction_prompt(&sql, &first.to_string()));
            match self.model.complete(fix).await {
                Ok(raw) => sql = clean_sql(&raw),
                Err(e) => {
                    return fallback_outcome(
                        SqlStatus::ValidationFailed,
                        Some(sql),
                        Some(e.to_string()),
                        corrected,
                    )
                }
            }

            if let Err(second) = self.dry_run(warehouse, &sql).await {
                warn!(error = %second, "corrected SQL failed validation");
                return fallback_outcome(
                    SqlStatus::ValidationFailed,
                    Some(sql),
                    Some(second.to_string()),
                    corrected,
                );
            }
        }

        match warehouse.query(&bound_query(&sql)).await {
            Ok(mut rows) => {
                rows.truncate(MAX_ROWS);
                SqlOutcome {
                    status: SqlStatus::Success,
                    data: render_rows(&rows),
                    row_count: rows.len(),
                    sql: Some(sql),
                    error: None,
                    corrected,
                }
            }
            Err(e) => {
                warn!(error = %e, "SQL execution failed");
                fallback_outcome(SqlStatus::ExecError, Some(sql), Some(e.to_string()), corrected)
            }
        }
    }

    async fn dry_run(&self, warehouse: &dyn Warehouse, sql: &str) -> Result<()> {
        tokio::time::timeout(self.dry_run_timeout, warehouse.dry_run(sql))
            .await
            .map_err(|_| anyhow!("dry run timed out after {:?}", self.dry_run_timeout))?
    }
}

fn fallback_outcome(
    status: SqlStatus,
    sql: Option<String>,
    error: Option<String>,
    corrected: bool,
) -> SqlOutcome {
    SqlOutcome {
        status,
        sql,
        data: fallback_dataset(),
        row_count: 0,
        error,
        corrected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_query_wraps_any_limit() {
        assert_eq!(
            bound_query("SELECT name FROM `p.d.customers` LIMIT 10000"),
            "SELECT * FROM (SELECT name FROM `p.d.customers` LIMIT 10000) LIMIT 500"
        );
    }

    #[test]
    fn clean_sql_strips_fences_and_semicolons() {
        assert_eq!(
            clean_sql("```sql\nSELECT 1;\n```"),
            "SELECT 1"
        );
        assert_eq!(clean_sql("  NO_SQL_NEEDED \n"), NO_SQL_SENTINEL);
    }

    #[test]
    fn correction_prompt_carries_sql_and_error() {
        let prompt = correction_prompt("SELECT arr FROM t", "Unrecognized name: arr");
        assert!(prompt.contains("SQL:\nSELECT arr FROM t"));
        assert!(prompt.ends_with("Error:\nUnrecognized name: arr"));
    }
}
