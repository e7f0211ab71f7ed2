//! The three-stage question pipeline.
//!
//! ```text
//!  question ─▶ router ─▶ routing event
//!                 │
//!        ┌────────┴─────────┐        (concurrent, tokio::join!)
//!        ▼                  ▼
//!   SQL engine        upload index text
//!        └────────┬─────────┘
//!                 ▼
//!       sql event (if SQL ran) ─▶ answer tokens ─▶ done
//! ```
//!
//! Each submitted question runs on its own task under a `query` span. The
//! caller receives events through a bounded channel; dropping the receiver
//! stops delivery while in-flight model and warehouse calls finish.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::answer::{AnswerEngine, AnswerRequest};
use crate::models::{ConversationTurn, DataSource, QueryEvent};
use crate::router::QueryRouter;
use crate::sql::SqlEngine;
use crate::uploads::UploadIndex;

const BANNER: &str = "==================================================";

/// Placeholder source block when neither source produced anything.
pub const NO_SOURCE_DATA: &str = "(no source data was retrieved for this question)";

/// Body of `POST /query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

pub struct Pipeline {
    router: QueryRouter,
    sql: SqlEngine,
    answer: AnswerEngine,
    uploads: Arc<UploadIndex>,
    dataset: String,
}

impl Pipeline {
    pub fn new(
        router: QueryRouter,
        sql: SqlEngine,
        answer: AnswerEngine,
        uploads: Arc<UploadIndex>,
        dataset: String,
    ) -> Self {
        Self {
            router,
            sql,
            answer,
            uploads,
            dataset,
        }
    }

    /// Start answering `request` on a new task and return its event stream.
    pub fn submit(self: &Arc<Self>, request: QueryRequest) -> ReceiverStream<QueryEvent> {
        let (tx, rx) = mpsc::channel(64);
        let pipeline = Arc::clone(self);
        let span = info_span!("query", id = %Uuid::new_v4());
        tokio::spawn(async move { pipeline.run(request, tx).await }.instrument(span));
        ReceiverStream::new(rx)
    }

    /// Run every stage, sending events to `events`.
    pub async fn run(&self, request: QueryRequest, events: mpsc::Sender<QueryEvent>) {
        let question = request.question.trim();
        let history = &request.history;
        info!(question, turns = history.len(), "question received");

        // Stage 1
        let decision = self.router.run_router(question, history).await;
        let routing = QueryEvent::Routing {
            sources: decision.sources.clone(),
            query_type: decision.query_type,
            intent_tag: decision.intent_tag,
            reasoning: decision.reasoning.clone(),
        };
        if events.send(routing).await.is_err() {
            return;
        }

        // Stage 2
        let run_sql = decision.needs_sql && decision.uses(DataSource::Warehouse);
        let read_uploads = decision.uses(DataSource::Uploads);
        let (sql_outcome, uploads) = tokio::join!(
            async {
                if run_sql {
                    Some(
                        self.sql
                            .generate_and_run(question, &decision.sql_intent, history)
                            .await,
                    )
                } else {
                    None
                }
            },
            async {
                if read_uploads {
                    Some(self.uploads.counted_text().await)
                } else {
                    None
                }
            }
        );

        let mut source_blocks = String::new();
        if let Some(outcome) = &sql_outcome {
            let event = QueryEvent::Sql {
                sql: outcome.sql.clone(),
                status: outcome.status,
            };
            if events.send(event).await.is_err() {
                return;
            }
            if !outcome.data.is_empty() {
                source_blocks.push_str(&format!(
                    "\n{BANNER}\nSOURCE: BigQuery ({})\n{BANNER}\n{}\n",
                    self.dataset, outcome.data
                ));
            }
        }
        if let Some((count, text)) = uploads {
            if count > 0 && !text.is_empty() {
                source_blocks.push_str(&format!(
                    "\n{BANNER}\nSOURCE: USER UPLOADS ({} file(s))\n{BANNER}\n{}\n",
                    count, text
                ));
            }
        }
        if source_blocks.is_empty() {
            source_blocks.push_str(NO_SOURCE_DATA);
        }

        // Stage 3
        let metadata = self
            .answer
            .stream_answer(
                AnswerRequest {
                    question,
                    history,
                    source_blocks: &source_blocks,
                    sources: &decision.sources,
                    query_type: decision.query_type,
                    intent_tag: decision.intent_tag,
                },
                &events,
            )
            .await;

        info!(
            sources = ?decision.sources,
            sql_status = ?sql_outcome.as_ref().map(|o| o.status),
            confidence = ?metadata.confidence,
            "question answered"
        );
    }
}
