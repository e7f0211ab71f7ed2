//! Data warehouse access.
//!
//! The [`Warehouse`] trait covers the two calls the SQL engine needs: a
//! zero-cost dry run that validates a query, and a real execution returning
//! rows as JSON objects. [`BigQuery`] implements it against the BigQuery v2
//! REST API (`jobs.query` / `jobs.getQueryResults`), authenticated through
//! [`GcpAuth`]. A `401` drops the cached token and, when the credentials can
//! be refreshed, retries once with a new one.
//!
//! This module also owns the static schema summary shown to the models, the
//! data dictionary cache cleared by `POST /reload`, and the offline fallback
//! dataset used whenever live data cannot be fetched.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::WarehouseConfig;
use crate::gcp_auth::GcpAuth;

/// One result row: column name → value.
pub type Row = Map<String, Value>;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Project that fully qualified table names are built from.
    fn project(&self) -> &str;

    fn dataset(&self) -> &str;

    /// Validate `sql` without executing it. `Err` carries the backend message.
    async fn dry_run(&self, sql: &str) -> Result<()>;

    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Most recent authentication failure not yet cleared by a successful call.
    async fn auth_failure(&self) -> Option<String> {
        None
    }
}

/// Build a BigQuery client when the config names a project and credentials
/// are present. `Ok(None)` means the warehouse is simply not configured.
pub fn create_warehouse(config: &WarehouseConfig) -> Result<Option<BigQuery>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let auth = GcpAuth::from_env(config.credentials_file.as_deref())?;
    Ok(Some(BigQuery::new(config, auth)?))
}

// ============ BigQuery REST ============

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";

pub struct BigQuery {
    project: String,
    dataset: String,
    location: Option<String>,
    auth: GcpAuth,
    api_base: String,
    query_timeout: Duration,
    client: reqwest::Client,
}

impl BigQuery {
    pub fn new(config: &WarehouseConfig, auth: GcpAuth) -> Result<Self> {
        let project = config
            .project
            .clone()
            .ok_or_else(|| anyhow!("warehouse.project required for BigQuery"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs))
            .build()?;

        Ok(Self {
            project,
            dataset: config.dataset.clone(),
            location: config.location.clone(),
            auth,
            api_base: BIGQUERY_API.to_string(),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            client,
        })
    }

    /// Point the client at another BigQuery-compatible endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Send an authenticated request, refreshing the token once on `401`.
    async fn send<F>(&self, label: &str, build: F) -> Result<QueryResponse>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let token = self.auth.token().await?;
            let response = build(&token)
                .send()
                .await
                .with_context(|| format!("{} failed", label))?;

            if response.status() != reqwest::StatusCode::UNAUTHORIZED {
                self.auth.clear_failure().await;
                return decode_response(response).await;
            }

            let message = error_message(response).await;
            self.auth.invalidate().await;
            if self.auth.can_refresh() && !refreshed {
                warn!(%message, "access token rejected, refreshing");
                refreshed = true;
                continue;
            }
            let failure = if self.auth.can_refresh() {
                format!("access token rejected: {}", message)
            } else {
                format!(
                    "access token rejected (BIGQUERY_ACCESS_TOKEN has probably expired): {}",
                    message
                )
            };
            self.auth.record_failure(failure.clone()).await;
            bail!("BigQuery error 401 Unauthorized: {}", failure);
        }
    }

    async fn post_query(&self, sql: &str, dry_run: bool) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.api_base, self.project);
        let mut body = serde_json::json!({
            "query": sql,
            "useLegacySql": false,
            "dryRun": dry_run,
            "useQueryCache": false,
            "timeoutMs": self.query_timeout.as_millis() as u64,
        });
        if let Some(location) = &self.location {
            body["location"] = Value::String(location.clone());
        }

        self.send(&format!("POST {}", url), |token| {
            self.client.post(&url).bearer_auth(token).json(&body)
        })
        .await
    }

    async fn poll_results(&self, job: &JobReference) -> Result<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, job.project_id, job.job_id
        );
        let mut params = vec![("timeoutMs", "10000".to_string())];
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            params.push(("location", location.clone()));
        }

        self.send(&format!("GET {}", url), |token| {
            self.client.get(&url).bearer_auth(token).query(&params)
        })
        .await
    }
}

#[async_trait]
impl Warehouse for BigQuery {
    fn project(&self) -> &str {
        &self.project
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    async fn dry_run(&self, sql: &str) -> Result<()> {
        self.post_query(sql, true).await.map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let started = Instant::now();
        let mut response = self.post_query(sql, false).await?;

        while !response.job_complete {
            if started.elapsed() > self.query_timeout {
                bail!("query did not complete within {:?}", self.query_timeout);
            }
            let job = response
                .job_reference
                .as_ref()
                .ok_or_else(|| anyhow!("incomplete query without a job reference"))?;
            debug!(job_id = %job.job_id, "waiting for query results");
            response = self.poll_results(job).await?;
        }

        Ok(response.into_rows())
    }

    async fn auth_failure(&self) -> Option<String> {
        self.auth.failure().await
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorEnvelope>(&text)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| text.chars().take(500).collect())
}

async fn decode_response(response: reqwest::Response) -> Result<QueryResponse> {
    let status = response.status();
    if !status.is_success() {
        bail!("BigQuery error {}: {}", status, error_message(response).await);
    }
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).context("Invalid BigQuery response")
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorMessage,
}

#[derive(Deserialize)]
struct ErrorMessage {
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default = "yes")]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize, Default)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
}

#[derive(Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

impl QueryResponse {
    fn into_rows(self) -> Vec<Row> {
        let fields = self.schema.map(|s| s.fields).unwrap_or_default();
        self.rows
            .into_iter()
            .map(|row| {
                fields
                    .iter()
                    .zip(row.f)
                    .map(|(field, cell)| (field.name.clone(), typed_value(&field.field_type, cell.v)))
                    .collect()
            })
            .collect()
    }
}

/// BigQuery returns scalars as strings; restore numbers and booleans.
fn typed_value(field_type: &str, value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };
    match field_type {
        "INTEGER" | "INT64" => s.parse::<i64>().map(Value::from).unwrap_or(value),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => s
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(value),
        "BOOLEAN" | "BOOL" => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value,
        },
        _ => value,
    }
}

// ============ Schema, dictionary, fallback ============

/// Static description of the warehouse tables given to every model prompt.
pub fn schema_summary(project: &str, dataset: &str) -> String {
    format!(
        "BigQuery project: {project}  dataset: {dataset}

TABLE customers
  customer_id STRING, name STRING, industry STRING, tier STRING,
  region STRING, country STRING,
  arr_usd INT64            -- RECOGNIZED ARR (current billing period)
  arr_bookings_usd INT64   -- BOOKED ARR (signed contract value)
  seats_contracted INT64   -- seats on signed order form
  seats_active INT64       -- seats with login in last 30 days
  contract_start DATE, contract_end DATE,
  csm_owner STRING         -- Customer Success Manager (retention)
  ae_owner STRING          -- Account Executive (sold the deal)
  status STRING            -- Active / At-Risk / Churned / Prospect
  health_score INT64       -- 0-100 composite
  nps_score INT64          -- -100 to +100
  products STRING, created_at TIMESTAMP

TABLE subscriptions
  sub_id STRING, customer_id STRING, product STRING,
  seats_contracted INT64, seats_active INT64,
  list_price_unit INT64    -- price per seat per year = P
  list_price_total INT64   -- list_price_unit x seats_contracted = P*Q
  discount_pct FLOAT64, mrr_usd INT64, arr_usd INT64,
  status STRING, start_date DATE, end_date DATE, auto_renew BOOL, tier STRING

TABLE revenue_monthly
  month STRING, arr_usd INT64, mrr_usd INT64,
  new_arr INT64, expansion_arr INT64, churned_arr INT64,
  net_new_arr INT64, nrr_pct FLOAT64,
  customers_count INT64, new_logos INT64, churned_logos INT64

TABLE support_tickets
  ticket_id STRING, customer_id STRING,
  created_date DATE, resolved_date DATE,
  severity STRING, category STRING, subject STRING, status STRING,
  csat_score INT64, resolution_hrs INT64

TABLE usage_metrics
  customer_id STRING, month STRING,
  active_users INT64, seats_contracted INT64, seat_utilization FLOAT64,
  api_calls INT64, alerts_triggered INT64, alerts_actioned INT64,
  logins_per_user FLOAT64, feature_adoption FLOAT64"
    )
}

/// Render executed rows for the answer prompt.
pub fn render_rows(rows: &[Row]) -> String {
    let json = serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string());
    format!("BigQuery results ({} rows):\n{}", rows.len(), json)
}

/// Column-disambiguation notes, read lazily and cached until cleared.
pub struct DataDictionary {
    path: Option<PathBuf>,
    cache: RwLock<Option<String>>,
}

impl DataDictionary {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Fixed text, never read from disk.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self {
            path: None,
            cache: RwLock::new(Some(text.into())),
        }
    }

    /// Dictionary text; empty when no file is configured or it cannot be read.
    pub async fn text(&self) -> String {
        if let Some(text) = self.cache.read().await.as_ref() {
            return text.clone();
        }

        let Some(path) = &self.path else {
            return String::new();
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "data dictionary unreadable");
                String::new()
            }
        };
        *self.cache.write().await = Some(text.clone());
        text
    }

    /// Drop the cached text so the next read goes back to disk.
    /// Returns whether anything was cached.
    pub async fn clear(&self) -> bool {
        if self.path.is_none() {
            return false;
        }
        let cleared = self.cache.write().await.take().is_some();
        if cleared {
            info!("data dictionary cache cleared");
        }
        cleared
    }
}

/// Small offline dataset substituted whenever live warehouse data is
/// unavailable, so answers always have something to reason over.
pub fn fallback_dataset() -> String {
    let data = serde_json::json!({
        "note": "BigQuery unavailable — inline fallback data",
        "customers": [
            {"name": "Apex Financial",    "tier": "Enterprise", "arr_usd": 480000, "seats_contracted": 850,  "seats_active": 848, "csm_owner": "Priya Nair",     "status": "Active",  "health_score": 82},
            {"name": "Meridian Trading",  "tier": "Enterprise", "arr_usd": 540000, "seats_contracted": 1100, "seats_active": 890, "csm_owner": "Wei Zhang",      "status": "At-Risk", "health_score": 31},
            {"name": "Vantage Capital",   "tier": "Enterprise", "arr_usd": 360000, "seats_contracted": 620,  "seats_active": 595, "csm_owner": "James Okoye",    "status": "Active",  "health_score": 77},
            {"name": "NordBank AG",       "tier": "Mid-Market", "arr_usd": 144000, "seats_contracted": 200,  "seats_active": 0,   "csm_owner": "Sophie Laurent", "status": "Churned", "health_score": 0},
            {"name": "Pinnacle Wealth",   "tier": "SMB",        "arr_usd": 36000,  "seats_contracted": 45,   "seats_active": 22,  "csm_owner": "James Okoye",    "status": "Active",  "health_score": 55},
            {"name": "GoldLeaf Advisors", "tier": "Mid-Market", "arr_usd": 96000,  "seats_contracted": 175,  "seats_active": 155, "csm_owner": "Sophie Laurent", "status": "Active",  "health_score": 91}
        ],
        "revenue_monthly_latest": [
            {"month": "2024-07", "arr_usd": 2230000, "nrr_pct": 114.8, "new_logos": 4},
            {"month": "2024-08", "arr_usd": 2310000, "nrr_pct": 112.4, "new_logos": 2},
            {"month": "2024-09", "arr_usd": 2220000, "nrr_pct": 112.1, "new_logos": 2}
        ],
        "subscriptions_sample": [
            {"customer": "Apex Financial",   "product": "ThreatShield Enterprise",    "list_price_unit": 420, "list_price_total": 357000, "seats_contracted": 850},
            {"customer": "Meridian Trading", "product": "ThreatShield Enterprise",    "list_price_unit": 420, "list_price_total": 462000, "seats_contracted": 1100},
            {"customer": "Meridian Trading", "product": "Threat Intelligence Add-on", "list_price_unit": 0,   "list_price_total": 45000,  "seats_contracted": 0}
        ]
    });
    serde_json::to_string_pretty(&data).unwrap_or_default()
}
