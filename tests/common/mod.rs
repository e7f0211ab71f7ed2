//! Scripted stand-ins for the language model, the warehouse and object
//! storage, plus helpers to start an [`App`] on top of them.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tempfile::TempDir;

use data_concierge::app::{App, Backends};
use data_concierge::blob_store::{BlobStore, LocalStore};
use data_concierge::config::Config;
use data_concierge::llm::{ChatRequest, LanguageModel, ModelTier, TokenStream};
use data_concierge::models::QueryEvent;
use data_concierge::pipeline::QueryRequest;
use data_concierge::warehouse::{DataDictionary, Row, Warehouse};

// ─── Language model ─────────────────────────────────────────────────

/// Replays queued replies. Router-tier completions and answer-tier
/// completions (SQL generation and correction) have separate queues; an
/// empty queue answers with an error.
#[derive(Default)]
pub struct ScriptedModel {
    router_replies: Mutex<VecDeque<Result<String, String>>>,
    sql_replies: Mutex<VecDeque<Result<String, String>>>,
    fragments: Mutex<Vec<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
    pub router_calls: AtomicUsize,
    pub sql_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, reply: &str) -> Self {
        self.router_replies
            .lock()
            .unwrap()
            .push_back(Ok(reply.to_string()));
        self
    }

    pub fn sql(self, reply: &str) -> Self {
        self.sql_replies.lock().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    pub fn sql_error(self, message: &str) -> Self {
        self.sql_replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn answer(self, fragments: &[&str]) -> Self {
        *self.fragments.lock().unwrap() = fragments.iter().map(|f| Ok(f.to_string())).collect();
        self
    }

    /// Stream `fragments`, then fail.
    pub fn answer_then_fail(self, fragments: &[&str], message: &str) -> Self {
        let mut script: Vec<Result<String, String>> =
            fragments.iter().map(|f| Ok(f.to_string())).collect();
        script.push(Err(message.to_string()));
        *self.fragments.lock().unwrap() = script;
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prompt of the streamed answer request, if one was made.
    pub fn answer_prompt(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.tier == ModelTier::Answer && r.system.is_some())
            .map(|r| r.prompt.clone())
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn is_available(&self) -> bool {
        true
    }

    fn model_name(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Router => "scripted-router",
            ModelTier::Answer => "scripted-answer",
        }
    }

    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let tier = request.tier;
        self.requests.lock().unwrap().push(request);
        let queue = match tier {
            ModelTier::Router => {
                self.router_calls.fetch_add(1, Ordering::SeqCst);
                &self.router_replies
            }
            ModelTier::Answer => {
                self.sql_calls.fetch_add(1, Ordering::SeqCst);
                &self.sql_replies
            }
        };
        match queue.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("no scripted reply for {:?}", tier),
        }
    }

    async fn stream(&self, request: ChatRequest) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(request);
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.fragments.lock().unwrap().clone();
        Ok(futures::stream::iter(script.into_iter().map(|f| f.map_err(|m| anyhow!(m)))).boxed())
    }
}

// ─── Warehouse ──────────────────────────────────────────────────────

/// Warehouse whose dry runs follow a script (then pass) and whose queries
/// return fixed rows. The startup probe (`SELECT 1`) is not counted.
pub struct ScriptedWarehouse {
    probe_ok: bool,
    dry_runs: Mutex<VecDeque<Result<(), String>>>,
    rows: Vec<Row>,
    query_error: Option<String>,
    pub dry_run_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedWarehouse {
    pub fn new() -> Self {
        Self {
            probe_ok: true,
            dry_runs: Mutex::new(VecDeque::new()),
            rows: Vec::new(),
            query_error: None,
            dry_run_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            probe_ok: false,
            ..Self::new()
        }
    }

    pub fn rows(mut self, rows: Vec<Value>) -> Self {
        self.rows = rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self
    }

    pub fn reject_dry_run(self, message: &str) -> Self {
        self.dry_runs
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn fail_queries(mut self, message: &str) -> Self {
        self.query_error = Some(message.to_string());
        self
    }

    /// SQL text of every executed query.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for ScriptedWarehouse {
    fn project(&self) -> &str {
        "acme-analytics"
    }

    fn dataset(&self) -> &str {
        "saasmetrics"
    }

    async fn dry_run(&self, sql: &str) -> Result<()> {
        if sql == "SELECT 1" {
            return if self.probe_ok {
                Ok(())
            } else {
                bail!("connection refused")
            };
        }
        self.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        match self.dry_runs.lock().unwrap().pop_front() {
            Some(Err(message)) => Err(anyhow!(message)),
            _ => Ok(()),
        }
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.executed.lock().unwrap().push(sql.to_string());
        match &self.query_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.rows.clone()),
        }
    }
}

// ─── Object storage ─────────────────────────────────────────────────

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, filename: &str, bytes: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(filename.to_string(), bytes.to_vec());
        self
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.objects.lock().unwrap().contains_key(filename)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }

    async fn get(&self, filename: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(filename)
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {}", filename))
    }

    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(filename.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(filename);
        Ok(())
    }
}

/// Object store that is always down.
pub struct FailingStore;

#[async_trait]
impl BlobStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn list(&self) -> Result<Vec<String>> {
        bail!("service unavailable")
    }

    async fn get(&self, _filename: &str) -> Result<Vec<u8>> {
        bail!("service unavailable")
    }

    async fn put(&self, _filename: &str, _bytes: &[u8]) -> Result<()> {
        bail!("service unavailable")
    }

    async fn delete(&self, _filename: &str) -> Result<()> {
        bail!("service unavailable")
    }
}

// ─── App ────────────────────────────────────────────────────────────

pub struct TestApp {
    pub app: Arc<App>,
    pub model: Arc<ScriptedModel>,
    pub warehouse: Option<Arc<ScriptedWarehouse>>,
    pub tmp: TempDir,
}

pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.upload_dir = tmp.path().join("uploads");
    config
}

pub async fn start_app(model: ScriptedModel, warehouse: Option<ScriptedWarehouse>) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    start_app_with(config, tmp, model, warehouse, None).await
}

pub async fn start_app_with(
    config: Config,
    tmp: TempDir,
    model: ScriptedModel,
    warehouse: Option<ScriptedWarehouse>,
    remote: Option<Arc<dyn BlobStore>>,
) -> TestApp {
    let model = Arc::new(model);
    let warehouse = warehouse.map(Arc::new);
    let local = Arc::new(LocalStore::open(&config.storage.upload_dir).unwrap());

    let backends = Backends {
        model: model.clone(),
        warehouse: warehouse.clone().map(|w| w as Arc<dyn Warehouse>),
        remote,
        local,
        dictionary: Arc::new(DataDictionary::fixed("")),
    };
    let app = Arc::new(App::start(config, backends).await);

    TestApp {
        app,
        model,
        warehouse,
        tmp,
    }
}

/// Run one question to completion and collect its events.
pub async fn ask(app: &App, question: &str) -> Vec<QueryEvent> {
    app.pipeline
        .submit(QueryRequest {
            question: question.to_string(),
            history: Vec::new(),
        })
        .collect()
        .await
}

/// Concatenated text of every token event.
pub fn answer_text(events: &[QueryEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            QueryEvent::Token { token } => Some(token.as_str()),
            _ => None,
        })
        .collect()
}
