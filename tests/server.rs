//! HTTP server tests: every route is driven over a real socket.

mod common;

use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use common::{start_app_with, test_config, MemoryStore, ScriptedModel, ScriptedWarehouse, TestApp};
use data_concierge::server::run_server;

const BOUNDARY: &str = "dcx-test-boundary";

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

/// Start a server on a free port and return its base URL.
async fn serve(model: ScriptedModel, warehouse: Option<ScriptedWarehouse>) -> (TestApp, String) {
    let port = find_free_port();
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.server.bind = format!("127.0.0.1:{}", port);
    config.uploads.max_upload_mb = 1;

    let remote: Arc<dyn data_concierge::blob_store::BlobStore> = Arc::new(MemoryStore::new());
    let t = start_app_with(config, tmp, model, warehouse, Some(remote)).await;
    let app = t.app.clone();
    tokio::spawn(async move { run_server(app).await });
    wait_for_server(port).await;

    (t, format!("http://127.0.0.1:{}", port))
}

fn multipart_body(filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        filename
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn upload(base: &str, filename: &str, content: &[u8]) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/upload", base))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(multipart_body(filename, content))
        .send()
        .await
        .unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_capabilities() {
    let (_t, base) = serve(ScriptedModel::new(), Some(ScriptedWarehouse::new())).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["llm"], true);
    assert_eq!(body["warehouse"], true);
    assert_eq!(body["blob_storage"], true);
    assert_eq!(body["router_model"], "gpt-4o-mini");
    assert_eq!(body["uploads_indexed"], 0);
}

#[tokio::test]
async fn test_health_is_degraded_without_warehouse() {
    let (_t, base) = serve(ScriptedModel::new(), None).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "degraded");
    assert_eq!(body["warehouse"], false);
}

#[tokio::test]
async fn test_upload_list_and_delete() {
    let (t, base) = serve(ScriptedModel::new(), None).await;

    let resp = upload(&base, "Q3 deals.csv", b"account,amount\nApex,1200000\n").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["filename"], "Q3_deals.csv");
    assert_eq!(body["source_type"], "CSV");
    assert_eq!(body["storage"], "remote");
    assert!(body["preview"].as_str().unwrap().contains("Apex"));

    let list: Value = reqwest::get(format!("{}/uploads", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["files"][0]["filename"], "Q3_deals.csv");

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{}/upload/Q3_deals.csv", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(t.app.uploads.is_empty().await);

    let resp = client
        .delete(format!("{}/upload/Q3_deals.csv", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_upload_rejects_unsupported_type() {
    let (t, base) = serve(ScriptedModel::new(), None).await;

    let resp = upload(&base, "notes.txt", b"hello").await;

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_type");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Allowed: .xlsx, .xls, .pdf, .docx, .csv"));
    assert!(t.app.uploads.is_empty().await);
}

#[tokio::test]
async fn test_upload_rejects_oversized_file() {
    let (t, base) = serve(ScriptedModel::new(), None).await;

    let content = vec![b'a'; 1024 * 1024 + 512];
    let resp = upload(&base, "huge.csv", &content).await;

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "file_too_large");
    assert!(t.app.uploads.is_empty().await);
}

#[tokio::test]
async fn test_reload_clears_cache() {
    let (_t, base) = serve(ScriptedModel::new(), None).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/reload", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "source cache cleared");
}

#[tokio::test]
async fn test_query_streams_server_sent_events() {
    let model = ScriptedModel::new()
        .route(r#"{"sources": ["bigquery"], "needs_sql": true, "sql_intent": "ARR", "query_type": "single_source", "intent_tag": "revenue", "reasoning": "warehouse metric"}"#)
        .sql("SELECT SUM(arr_usd) AS arr FROM `acme-analytics.saasmetrics.customers`")
        .answer(&[
            "ARR is $2.45M [BigQuery: customers].",
            "\nMETADATA::{\"sources_used\": [\"bigquery\"], \"confidence\": \"high\"}",
        ]);
    let warehouse = ScriptedWarehouse::new().rows(vec![serde_json::json!({"arr": 2450000})]);
    let (_t, base) = serve(model, Some(warehouse)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&serde_json::json!({"question": "What is our ARR?", "history": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers()["cache-control"].to_str().unwrap(), "no-cache");

    let body = resp.text().await.unwrap();
    let routing = body.find("event: routing").expect("routing event");
    let sql = body.find("event: sql").expect("sql event");
    let token = body.find("event: token").expect("token event");
    let done = body.find("event: done").expect("done event");
    assert!(routing < sql && sql < token && token < done);
    assert!(body.contains(r#""status":"success""#));
    assert!(body.contains(r#""done":true"#));
    assert!(body.contains(r#""confidence":"high""#));
    assert!(!body.contains("METADATA::"));
}

#[tokio::test]
async fn test_query_rejects_empty_question() {
    let (t, base) = serve(ScriptedModel::new(), None).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&serde_json::json!({"question": "   "}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(
        t.model.router_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_router_serves_without_socket() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let t = common::start_app(ScriptedModel::new(), None).await;
    let router = data_concierge::server::build_router(t.app.clone());

    let resp = router
        .oneshot(
            Request::post("/query")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}
