//! End-to-end question pipeline: routing, SQL, answer streaming and the
//! event sequence a client sees.

mod common;

use std::sync::atomic::Ordering;

use serde_json::json;

use common::{answer_text, ask, start_app, ScriptedModel, ScriptedWarehouse};
use data_concierge::answer::NO_DATA_PHRASE;
use data_concierge::models::{
    AnswerMetadata, Confidence, DataSource, IntentTag, QueryEvent, SqlStatus,
};
use data_concierge::pipeline::NO_SOURCE_DATA;
use data_concierge::sql::MAX_ROWS;

const ARR_ROUTE: &str = r#"{"sources": ["bigquery"], "needs_sql": true, "sql_intent": "total current ARR", "query_type": "single_source", "intent_tag": "revenue", "reasoning": "ARR lives in the warehouse"}"#;

const ARR_SQL: &str = "```sql\nSELECT SUM(arr_usd) AS arr FROM `acme-analytics.saasmetrics.customers` WHERE status = 'Active';\n```";

fn event_names(events: &[QueryEvent]) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = events.iter().map(|e| e.name()).collect();
    names.dedup();
    names
}

fn sql_event(events: &[QueryEvent]) -> Option<(Option<String>, SqlStatus)> {
    events.iter().find_map(|e| match e {
        QueryEvent::Sql { sql, status } => Some((sql.clone(), *status)),
        _ => None,
    })
}

fn routed_sources(events: &[QueryEvent]) -> Vec<DataSource> {
    match events.first() {
        Some(QueryEvent::Routing { sources, .. }) => sources.clone(),
        other => panic!("first event should be routing, got {:?}", other),
    }
}

fn done_metadata(events: &[QueryEvent]) -> AnswerMetadata {
    match events.last() {
        Some(QueryEvent::Done { done, metadata }) => {
            assert!(done);
            metadata.clone()
        }
        other => panic!("last event should be done, got {:?}", other),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_warehouse_question_streams_cited_answer() {
    let model = ScriptedModel::new().route(ARR_ROUTE).sql(ARR_SQL).answer(&[
        "Current ARR is $2.45M ",
        "[BigQuery: customers].\n\nConfidence: HIGH\nMETA",
        r#"DATA::{"sources_used": ["bigquery"], "disambiguation_notes": "", "confidence": "high", "query_type": "single_source", "intent_tag": "revenue"}"#,
    ]);
    let warehouse = ScriptedWarehouse::new().rows(vec![json!({"arr": 2450000})]);
    let t = start_app(model, Some(warehouse)).await;

    let events = ask(&t.app, "What is our current ARR?").await;

    assert_eq!(event_names(&events), vec!["routing", "sql", "token", "done"]);
    assert_eq!(routed_sources(&events), vec![DataSource::Warehouse]);
    match &events[0] {
        QueryEvent::Routing { intent_tag, .. } => assert_eq!(*intent_tag, IntentTag::Revenue),
        _ => unreachable!(),
    }

    let (sql, status) = sql_event(&events).expect("sql event");
    assert_eq!(status, SqlStatus::Success);
    assert_eq!(
        sql.as_deref(),
        Some("SELECT SUM(arr_usd) AS arr FROM `acme-analytics.saasmetrics.customers` WHERE status = 'Active'")
    );

    let text = answer_text(&events);
    assert!(text.contains("[BigQuery: customers]"), "{}", text);
    assert!(!text.contains("METADATA"), "trailer leaked: {}", text);

    let metadata = done_metadata(&events);
    assert_eq!(metadata.sources_used, vec!["bigquery"]);
    assert_eq!(metadata.confidence, Some(Confidence::High));

    let prompt = t.model.answer_prompt().unwrap();
    assert!(prompt.contains("SOURCE: BigQuery (saasmetrics)"));
    assert!(prompt.contains("BigQuery results (1 rows)"));
    assert!(prompt.contains("2450000"));
}

#[tokio::test]
async fn test_upload_question_without_uploads_drops_uploads() {
    let model = ScriptedModel::new()
        .route(r#"{"sources": ["uploaded"], "needs_sql": false, "query_type": "upload_only", "intent_tag": "policy", "reasoning": "asks about the uploaded policy"}"#)
        .answer(&[NO_DATA_PHRASE, "\n\nConfidence: LOW"]);
    let t = start_app(model, Some(ScriptedWarehouse::new())).await;

    let events = ask(&t.app, "What does the uploaded policy say about refunds?").await;

    assert!(!routed_sources(&events).contains(&DataSource::Uploads));
    assert!(sql_event(&events).is_none());
    assert_eq!(t.model.sql_calls.load(Ordering::SeqCst), 0);
    assert!(answer_text(&events).contains(NO_DATA_PHRASE));
    // no trailer, no metadata
    assert_eq!(done_metadata(&events).confidence, None);

    let prompt = t.model.answer_prompt().unwrap();
    assert!(prompt.contains(NO_SOURCE_DATA));
}

#[tokio::test]
async fn test_failed_dry_run_is_corrected_once() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("SELECT SUM(arr) FROM customers")
        .sql("SELECT SUM(arr_usd) FROM `acme-analytics.saasmetrics.customers`")
        .answer(&["ARR is $2.45M [BigQuery: customers]."]);
    let warehouse = ScriptedWarehouse::new()
        .reject_dry_run("Unrecognized name: arr at [1:12]")
        .rows(vec![json!({"f0_": 2450000})]);
    let t = start_app(model, Some(warehouse)).await;

    let events = ask(&t.app, "What is our current ARR?").await;

    let (sql, status) = sql_event(&events).unwrap();
    assert_eq!(status, SqlStatus::Success);
    assert_eq!(
        sql.as_deref(),
        Some("SELECT SUM(arr_usd) FROM `acme-analytics.saasmetrics.customers`")
    );

    let warehouse = t.warehouse.as_ref().unwrap();
    assert_eq!(warehouse.dry_run_calls.load(Ordering::SeqCst), 2);
    assert_eq!(warehouse.executed().len(), 1);
    assert_eq!(t.model.router_calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.model.sql_calls.load(Ordering::SeqCst), 2);

    let correction = &t.model.requests()[2].prompt;
    assert!(correction.contains("Unrecognized name: arr"));
}

#[tokio::test]
async fn test_second_failed_dry_run_falls_back() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("SELECT bogus FROM customers")
        .sql("SELECT still_bogus FROM customers")
        .answer(&["Using fallback data."]);
    let warehouse = ScriptedWarehouse::new()
        .reject_dry_run("Unrecognized name: bogus")
        .reject_dry_run("Unrecognized name: still_bogus");
    let t = start_app(model, Some(warehouse)).await;

    let events = ask(&t.app, "What is our current ARR?").await;

    let (sql, status) = sql_event(&events).unwrap();
    assert_eq!(status, SqlStatus::ValidationFailed);
    assert_eq!(sql.as_deref(), Some("SELECT still_bogus FROM customers"));
    assert!(t.warehouse.as_ref().unwrap().executed().is_empty());
    assert_eq!(t.model.sql_calls.load(Ordering::SeqCst), 2);

    let prompt = t.model.answer_prompt().unwrap();
    assert!(prompt.contains("Meridian Trading"), "fallback data expected");
}

#[tokio::test]
async fn test_unreachable_warehouse_reports_unavailable() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .answer(&["Based on fallback data..."]);
    let t = start_app(model, Some(ScriptedWarehouse::unreachable())).await;

    assert!(!t.app.startup.warehouse_ready);
    assert_eq!(t.app.status().await.status, "degraded");

    let events = ask(&t.app, "What is our current ARR?").await;

    let (sql, status) = sql_event(&events).unwrap();
    assert_eq!(status, SqlStatus::Unavailable);
    assert!(sql.is_none());
    assert_eq!(t.model.sql_calls.load(Ordering::SeqCst), 0);
    assert!(t.model.answer_prompt().unwrap().contains("Apex Financial"));
}

#[tokio::test]
async fn test_execution_is_bounded() {
    let rows: Vec<_> = (0..600)
        .map(|i| json!({"customer_id": i, "name": format!("Customer {}", i)}))
        .collect();
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("SELECT customer_id, name FROM `acme-analytics.saasmetrics.customers`")
        .answer(&["Here are the customers."]);
    let t = start_app(model, Some(ScriptedWarehouse::new().rows(rows))).await;

    ask(&t.app, "List every customer").await;

    let executed = t.warehouse.as_ref().unwrap().executed();
    assert_eq!(
        executed,
        vec![format!(
            "SELECT * FROM (SELECT customer_id, name FROM `acme-analytics.saasmetrics.customers`) LIMIT {}",
            MAX_ROWS
        )]
    );
    let prompt = t.model.answer_prompt().unwrap();
    assert!(prompt.contains(&format!("BigQuery results ({} rows)", MAX_ROWS)));
    assert!(!prompt.contains("Customer 599"));
}

#[tokio::test]
async fn test_execution_error_uses_fallback_data() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("SELECT 1")
        .answer(&["ok"]);
    let warehouse = ScriptedWarehouse::new().fail_queries("Quota exceeded");
    let t = start_app(model, Some(warehouse)).await;

    let events = ask(&t.app, "What is our current ARR?").await;

    assert_eq!(sql_event(&events).unwrap().1, SqlStatus::ExecError);
    assert!(t.model.answer_prompt().unwrap().contains("Apex Financial"));
}

#[tokio::test]
async fn test_no_sql_needed_sends_no_warehouse_data() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("NO_SQL_NEEDED")
        .answer(&["That needs judgement, not data."]);
    let t = start_app(model, Some(ScriptedWarehouse::new())).await;

    let events = ask(&t.app, "Should we raise prices?").await;

    assert_eq!(sql_event(&events), Some((None, SqlStatus::NotNeeded)));
    assert_eq!(t.warehouse.as_ref().unwrap().dry_run_calls.load(Ordering::SeqCst), 0);
    assert!(t.model.answer_prompt().unwrap().contains(NO_SOURCE_DATA));
}

#[tokio::test]
async fn test_invalid_router_reply_falls_back_to_warehouse() {
    let model = ScriptedModel::new()
        .route("I think you should look in BigQuery.")
        .sql("SELECT 1 AS one")
        .answer(&["ok"]);
    let t = start_app(model, Some(ScriptedWarehouse::new())).await;

    let events = ask(&t.app, "How many seats does Apex use?").await;

    match &events[0] {
        QueryEvent::Routing {
            sources, reasoning, ..
        } => {
            assert_eq!(sources, &vec![DataSource::Warehouse]);
            assert!(reasoning.starts_with("router fallback:"), "{}", reasoning);
        }
        other => panic!("expected routing, got {:?}", other),
    }
    // the fallback routes straight to SQL with the question as intent
    assert_eq!(sql_event(&events).unwrap().1, SqlStatus::Success);
    assert!(t.model.requests()[1].prompt.contains("SQL intent from the router: How many seats does Apex use?"));
}

#[tokio::test]
async fn test_answer_stream_error_still_ends_with_done() {
    let model = ScriptedModel::new()
        .route(ARR_ROUTE)
        .sql("SELECT 1")
        .answer_then_fail(&["Current ARR ", "is M"], "connection reset");
    let t = start_app(model, Some(ScriptedWarehouse::new())).await;

    let events = ask(&t.app, "What is our current ARR?").await;

    let text = answer_text(&events);
    assert!(text.starts_with("Current ARR is M⚠️ Generation error: connection reset"), "{}", text);
    assert_eq!(done_metadata(&events), AnswerMetadata::default());
    assert_eq!(
        events.iter().filter(|e| matches!(e, QueryEvent::Done { .. })).count(),
        1
    );
}

#[tokio::test]
async fn test_uploaded_documents_reach_the_answer_prompt() {
    let model = ScriptedModel::new()
        .route(r#"{"sources": ["uploaded", "bigquery"], "needs_sql": false, "query_type": "multi_source", "intent_tag": "pipeline", "reasoning": "pipeline sheet was uploaded"}"#)
        .answer(&["Q3 pipeline is $1.2M [Uploaded: pipeline.csv]."]);
    let t = start_app(model, Some(ScriptedWarehouse::new())).await;
    t.app
        .uploads
        .upload("pipeline.csv", b"account,amount\nApex,1200000\n")
        .await
        .unwrap();

    let events = ask(&t.app, "What is the Q3 pipeline in my sheet?").await;

    assert_eq!(
        routed_sources(&events),
        vec![DataSource::Uploads, DataSource::Warehouse]
    );
    // warehouse selected without SQL: no SQL stage
    assert!(sql_event(&events).is_none());

    let prompt = t.model.answer_prompt().unwrap();
    assert!(prompt.contains("SOURCE: USER UPLOADS (1 file(s))"));
    assert!(prompt.contains("SOURCE: Uploaded CSV — pipeline.csv"));
    assert!(prompt.contains("Apex\t1200000"));
}
