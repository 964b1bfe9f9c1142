//! End-to-end tests for the evidence HTTP surface, including the full
//! submit → claim → anchor flow against the stub backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use skyproof::anchor::stub::StubBackend;
use skyproof::keeper;
use skyproof::server::{build_app, AppState};

const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

async fn spawn_api(db: skyproof::store::Database) -> (tokio::task::JoinHandle<()>, String) {
    let app = build_app(AppState { db, gateway: None });
    let (server, port) = common::spawn_test_server(app).await;
    (server, format!("http://127.0.0.1:{port}"))
}

#[tokio::test]
async fn evidence_submission_anchors_end_to_end() {
    // File-backed database: API and keeper share it the way separate
    // processes would in production.
    let (db, _db_file) = common::make_file_db().await;
    let (server, base_url) = spawn_api(db.clone()).await;

    // Finality after two polls, like a ledger that needs a few blocks.
    let backend = Arc::new(StubBackend::new(2, "wallet"));
    let keeper_handle = tokio::spawn(keeper::run(
        db.clone(),
        backend,
        common::fast_keeper_config(),
    ));

    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base_url}/evidence"))
        .json(&json!({ "digest_hex": SHA256_EMPTY }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["digest_hex"], SHA256_EMPTY);
    assert_eq!(body["attempts"], 0);
    let id = body["id"].as_str().unwrap().to_string();

    let final_body = timeout(Duration::from_secs(10), async {
        loop {
            let response = client
                .get(format!("{base_url}/evidence/{id}"))
                .send()
                .await
                .unwrap();
            let body: serde_json::Value = response.json().await.unwrap();
            match body["status"].as_str().unwrap() {
                "anchored" => break body,
                "failed_terminal" => panic!("job failed: {body}"),
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await
    .expect("job should anchor within the timeout");

    assert_eq!(final_body["attempts"], 1);
    assert!(final_body["last_error"].is_null());

    server.abort();
    keeper_handle.abort();
}

#[tokio::test]
async fn malformed_digest_is_rejected() {
    let db = common::make_db("bad_digest").await;
    let (server, base_url) = spawn_api(db).await;
    let client = reqwest::Client::new();

    for bad in ["", "abc123", "zz"] {
        let response = client
            .post(format!("{base_url}/evidence"))
            .json(&json!({ "digest_hex": bad }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "digest {bad:?}");
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }

    server.abort();
}

#[tokio::test]
async fn duplicate_id_is_rejected_with_conflict() {
    let db = common::make_db("dup_http").await;
    let (server, base_url) = spawn_api(db).await;
    let client = reqwest::Client::new();

    let payload = json!({ "id": "incident-42", "digest_hex": SHA256_EMPTY });

    let first = client
        .post(format!("{base_url}/evidence"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);

    let second = client
        .post(format!("{base_url}/evidence"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    let body: serde_json::Value = second.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("incident-42"));

    server.abort();
}

#[tokio::test]
async fn unknown_evidence_is_not_found() {
    let db = common::make_db("not_found").await;
    let (server, base_url) = spawn_api(db).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/evidence/unknown-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    server.abort();
}

#[tokio::test]
async fn listing_paginates_newest_first() {
    let db = common::make_db("pagination").await;
    let (server, base_url) = spawn_api(db).await;
    let client = reqwest::Client::new();

    for i in 0..3u8 {
        let digest = format!("{i:02x}").repeat(32);
        let response = client
            .post(format!("{base_url}/evidence"))
            .json(&json!({ "id": format!("job-{i}"), "digest_hex": digest }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    let response = client
        .get(format!("{base_url}/evidence?page=1&per_page=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["page"], 1);
    assert_eq!(body["per_page"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let response = client
        .get(format!("{base_url}/evidence?page=2&per_page=2"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Oversized per_page clamps instead of erroring.
    let response = client
        .get(format!("{base_url}/evidence?per_page=10000"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["per_page"], 100);

    server.abort();
}
