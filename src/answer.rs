//! Stage 3: grounded answer generation, streamed.
//!
//! The answer model is asked to close its reply with a single
//! `METADATA::{json}` line. [`MetadataSplitter`] sits between the model stream
//! and the client: text before the sentinel is forwarded as it arrives, while
//! any tail that could be the start of the sentinel is held back until the
//! next fragment settles it. Everything after the sentinel is buffered and
//! decoded into [`AnswerMetadata`] once the stream ends, so the trailer never
//! reaches the reader.
//!
//! Streaming always ends with exactly one `done` event, whether the model is
//! missing, fails to start, or errors halfway through.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::llm::{ChatRequest, LanguageModel, ModelTier};
use crate::models::{
    format_history, AnswerMetadata, Confidence, ConversationTurn, DataSource, IntentTag,
    QueryEvent, QueryType,
};
use crate::warehouse::DataDictionary;

pub const METADATA_SENTINEL: &str = "METADATA::";

/// Exact wording required when the sources do not contain the answer.
pub const NO_DATA_PHRASE: &str = "I don't have that data in the connected sources.";

const ANSWER_SYSTEM: &str = r#"You are the Enterprise Data Assistant.
You give business leaders accurate answers grounded in enterprise data.

DATA DICTIONARY (column disambiguation rules):
{data_dict}

STRICT RULES:
1. GROUND every claim in the SOURCE DATA provided. Never take numbers from memory.
   If the data is not in the sources, say exactly: "I don't have that data in the connected sources."
2. CITE sources inline: [BigQuery: table_name], [PDF §section], [Excel: SheetName], [Word: §X.Y], [Uploaded: filename]
3. DISAMBIGUATE visibly. When you use an ambiguous column, name both candidates and your choice:
   "I used seats_contracted (850) not seats_active (848) because you asked what they purchased."
4. NO extrapolation. Do not forecast or project past the data; describe trends only.
5. FLAG conflicts. If sources disagree, say so and state which one is authoritative.
6. RESOLVE follow-ups with the conversation history ("them", "that account", "same customer").
7. End every answer with one line: Confidence: HIGH, Confidence: MEDIUM or Confidence: LOW
   HIGH = fully grounded, MEDIUM = partially grounded, LOW = data unavailable or conflicting.

Answer in markdown with inline citations. Lead with the answer, not the method. Be concise."#;

const ANSWER_USER: &str = r#"SOURCE DATA:
{source_blocks}

CONVERSATION HISTORY:
{history}

QUESTION: {question}

After your answer, add this line on its own, outside any markdown:
METADATA::{"sources_used": {sources_list}, "disambiguation_notes": "...", "confidence": "high/medium/low", "query_type": "{query_type}", "intent_tag": "{intent_tag}"}"#;

/// Everything the answer stage needs for one question.
pub struct AnswerRequest<'a> {
    pub question: &'a str,
    pub history: &'a [ConversationTurn],
    pub source_blocks: &'a str,
    pub sources: &'a [DataSource],
    pub query_type: QueryType,
    pub intent_tag: IntentTag,
}

pub struct AnswerEngine {
    model: Arc<dyn LanguageModel>,
    dictionary: Arc<DataDictionary>,
    history_window: usize,
}

impl AnswerEngine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        dictionary: Arc<DataDictionary>,
        history_window: usize,
    ) -> Self {
        Self {
            model,
            dictionary,
            history_window,
        }
    }

    /// Stream the answer into `events`: tokens, then one `done` event.
    ///
    /// Returns the parsed metadata. Stops early (without `done`) only when
    /// the receiver has gone away.
    pub async fn stream_answer(
        &self,
        request: AnswerRequest<'_>,
        events: &mpsc::Sender<QueryEvent>,
    ) -> AnswerMetadata {
        if !self.model.is_available() {
            let _ = events
                .send(QueryEvent::token(
                    "⚠️ Language model not configured (set OPENAI_API_KEY and [llm] provider).",
                ))
                .await;
            let _ = events.send(QueryEvent::done(AnswerMetadata::default())).await;
            return AnswerMetadata::default();
        }

        let chat = ChatRequest::new(ModelTier::Answer, self.user_prompt(&request))
            .with_system(ANSWER_SYSTEM.replace("{data_dict}", &self.dictionary.text().await));

        let mut stream = match self.model.stream(chat).await {
            Ok(stream) => stream,
            Err(e) => return generation_error(events, &e).await,
        };

        let mut splitter = MetadataSplitter::new();
        let mut shown = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    if let Some(text) = splitter.flush_pending() {
                        let _ = events.send(QueryEvent::token(text)).await;
                    }
                    return generation_error(events, &e).await;
                }
            };
            if let Some(text) = splitter.push(&fragment) {
                shown.push_str(&text);
                if events.send(QueryEvent::token(text)).await.is_err() {
                    debug!("client disconnected during answer stream");
                    return AnswerMetadata::default();
                }
            }
        }

        let (tail, mut metadata) = splitter.finish();
        if let Some(text) = tail {
            shown.push_str(&text);
            if events.send(QueryEvent::token(text)).await.is_err() {
                return AnswerMetadata::default();
            }
        }
        if metadata != AnswerMetadata::default() && metadata.confidence.is_none() {
            metadata.confidence = confidence_from_text(&shown);
        }

        let _ = events.send(QueryEvent::done(metadata.clone())).await;
        metadata
    }

    fn user_prompt(&self, request: &AnswerRequest<'_>) -> String {
        let sources: Vec<&str> = request.sources.iter().map(|s| s.wire_name()).collect();
        ANSWER_USER
            .replace("{source_blocks}", request.source_blocks)
            .replace("{history}", &format_history(request.history, self.history_window))
            .replace("{question}", request.question)
            .replace(
                "{sources_list}",
                &serde_json::to_string(&sources).unwrap_or_else(|_| "[]".to_string()),
            )
            .replace("{query_type}", &wire_name(&request.query_type))
            .replace("{intent_tag}", &wire_name(&request.intent_tag))
    }
}

async fn generation_error(events: &mpsc::Sender<QueryEvent>, e: &anyhow::Error) -> AnswerMetadata {
    warn!(error = %e, "answer generation failed");
    let _ = events
        .send(QueryEvent::token(format!("⚠️ Generation error: {}", e)))
        .await;
    let _ = events.send(QueryEvent::done(AnswerMetadata::default())).await;
    AnswerMetadata::default()
}

/// Serialized name of a unit enum variant (`single_source`, `revenue`, …).
fn wire_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Confidence from the last `Confidence: X` line of an answer.
pub fn confidence_from_text(text: &str) -> Option<Confidence> {
    text.lines().rev().find_map(|line| {
        let line = line.trim().trim_matches('*').trim();
        let idx = line.to_ascii_lowercase().find("confidence:")?;
        let level = line[idx + "confidence:".len()..]
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .to_ascii_lowercase();
        match level.as_str() {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    })
}

/// Splits a token stream into displayable text and a trailing metadata segment.
#[derive(Debug, Default)]
pub struct MetadataSplitter {
    pending: String,
    trailer: Option<String>,
}

impl MetadataSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the text that is now safe to show.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if let Some(trailer) = self.trailer.as_mut() {
            trailer.push_str(fragment);
            return None;
        }

        self.pending.push_str(fragment);
        if let Some(pos) = self.pending.find(METADATA_SENTINEL) {
            let trailer = self.pending[pos + METADATA_SENTINEL.len()..].to_string();
            self.pending.truncate(pos);
            self.trailer = Some(trailer);
            return non_empty(std::mem::take(&mut self.pending));
        }

        let hold = held_suffix_start(&self.pending);
        let rest = self.pending.split_off(hold);
        let ready = std::mem::replace(&mut self.pending, rest);
        non_empty(ready)
    }

    /// Release held-back text when the stream ends abnormally. Nothing is
    /// released once the sentinel has been seen.
    pub fn flush_pending(&mut self) -> Option<String> {
        if self.trailer.is_some() {
            return None;
        }
        non_empty(std::mem::take(&mut self.pending))
    }

    /// End of stream: any text still owed to the reader, and the metadata.
    ///
    /// A trailer that does not decode is handed back as text, sentinel
    /// included, with empty metadata.
    pub fn finish(self) -> (Option<String>, AnswerMetadata) {
        match self.trailer {
            None => (non_empty(self.pending), AnswerMetadata::default()),
            Some(trailer) => match serde_json::from_str::<AnswerMetadata>(trailer.trim()) {
                Ok(metadata) => (None, metadata),
                Err(e) => {
                    warn!(error = %e, "answer metadata did not decode");
                    (
                        Some(format!("{}{}", METADATA_SENTINEL, trailer)),
                        AnswerMetadata::default(),
                    )
                }
            },
        }
    }
}

/// Index where the longest suffix of `text` that could begin the sentinel starts.
fn held_suffix_start(text: &str) -> usize {
    let earliest = text.len().saturating_sub(METADATA_SENTINEL.len() - 1);
    (earliest..text.len())
        .find(|&i| text.is_char_boundary(i) && METADATA_SENTINEL.starts_with(&text[i..]))
        .unwrap_or(text.len())
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
