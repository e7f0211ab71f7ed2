//! Stage 1: decide which sources a question needs.
//!
//! The router asks the fast model for a JSON [`RoutingDecision`], decodes it
//! strictly, then applies the source policies below. It never fails: any
//! problem yields [`RoutingDecision::fallback`].
//!
//! Policies applied after decoding:
//! - uploads are dropped while the upload index is empty;
//! - `needs_sql` only stays true when the warehouse is selected;
//! - a missing `sql_intent` on a SQL question becomes the question itself.

use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::llm::{ChatRequest, LanguageModel, ModelTier};
use crate::models::{
    format_history, ConversationTurn, DataSource, IntentTag, QueryType, RoutingDecision,
};
use crate::uploads::UploadIndex;

const ROUTER_PROMPT: &str = r#"You are the query router of an enterprise data assistant.

Available sources:
  bigquery  - live warehouse: customers, subscriptions, revenue_monthly, support_tickets, usage_metrics
  uploaded  - files the user uploaded (Excel, PDF, Word, CSV)

Warehouse schema summary:
{schema}

Uploads currently indexed: {uploads_manifest}

Conversation history (last {history_window} turns):
{history}

Current question: {question}

Reply with JSON only, no markdown and no commentary:
{
  "sources": ["bigquery", "uploaded"],
  "needs_sql": true,
  "sql_intent": "one sentence on what the SQL should retrieve, or null when needs_sql is false",
  "query_type": "single_source | multi_source | followup | upload_only",
  "intent_tag": "revenue | pipeline | churn | policy | pricing | account_health | usage | save_playbook | comparison | other",
  "reasoning": "one sentence on why these sources were chosen"
}

Rules:
- List only the sources the question needs.
- needs_sql may be true only when bigquery is listed.
- List uploaded only if files are indexed and they could answer the question.
- For follow-up questions, use the history to pick sources.
- bigquery is the default for customers, revenue, ARR, seats, health scores and support."#;

/// Shape the router model must produce. `sources` and `needs_sql` are
/// required; everything else has a default.
#[derive(Debug, Deserialize)]
struct RawDecision {
    sources: Vec<DataSource>,
    needs_sql: bool,
    #[serde(default)]
    sql_intent: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    query_type: QueryType,
    #[serde(default, deserialize_with = "null_as_default")]
    intent_tag: IntentTag,
    #[serde(default, deserialize_with = "null_as_default")]
    reasoning: String,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub struct QueryRouter {
    model: Arc<dyn LanguageModel>,
    uploads: Arc<UploadIndex>,
    schema: String,
    history_window: usize,
}

impl QueryRouter {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        uploads: Arc<UploadIndex>,
        schema: String,
        history_window: usize,
    ) -> Self {
        Self {
            model,
            uploads,
            schema,
            history_window,
        }
    }

    pub async fn run_router(&self, question: &str, history: &[ConversationTurn]) -> RoutingDecision {
        if !self.model.is_available() {
            return RoutingDecision::fallback(question, "language model unavailable");
        }

        let prompt = ROUTER_PROMPT
            .replace("{schema}", &self.schema)
            .replace("{uploads_manifest}", &self.uploads.routing_manifest().await)
            .replace("{history_window}", &self.history_window.to_string())
            .replace("{history}", &format_history(history, self.history_window))
            .replace("{question}", question);

        let raw = match self
            .model
            .complete(ChatRequest::new(ModelTier::Router, prompt))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "router call failed");
                return RoutingDecision::fallback(question, e);
            }
        };

        match decode_decision(&raw) {
            Ok(decoded) => {
                let has_uploads = !self.uploads.is_empty().await;
                let decision = apply_policies(decoded, question, has_uploads);
                debug!(?decision, "routing decision");
                decision
            }
            Err(e) => {
                warn!(error = %e, "router reply was not a valid decision");
                RoutingDecision::fallback(question, format!("invalid router reply: {}", e))
            }
        }
    }
}

/// Remove markdown code fences around a model reply.
pub fn strip_fences(raw: &str) -> String {
    raw.trim()
        .replace("```json", "")
        .replace("```sql", "")
        .replace("```", "")
        .trim()
        .to_string()
}

fn decode_decision(raw: &str) -> Result<RawDecision, serde_json::Error> {
    serde_json::from_str(&strip_fences(raw))
}

fn apply_policies(raw: RawDecision, question: &str, has_uploads: bool) -> RoutingDecision {
    let mut sources: Vec<DataSource> = Vec::new();
    for source in raw.sources {
        if source == DataSource::Uploads && !has_uploads {
            continue;
        }
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    let needs_sql = raw.needs_sql && sources.contains(&DataSource::Warehouse);
    let sql_intent = match raw.sql_intent {
        Some(intent) if !intent.trim().is_empty() => intent,
        _ if needs_sql => question.to_string(),
        _ => String::new(),
    };

    RoutingDecision {
        sources,
        needs_sql,
        sql_intent,
        query_type: raw.query_type,
        intent_tag: raw.intent_tag,
        reasoning: raw.reasoning,
    }
}
