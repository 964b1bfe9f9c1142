//! Shared utilities for skyproof integration tests.
//!
//! Each test gets its own named in-memory SQLite database; the
//! `mode=memory&cache=shared` URL form makes every connection in one pool
//! see the same data while keeping tests fully isolated from each other.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;

use skyproof::store::Database;

static POOL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Create an isolated in-memory database with migrations applied.
pub async fn make_db(tag: &str) -> Database {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let seq = POOL_SEQ.fetch_add(1, Ordering::Relaxed);
    let url = format!("sqlite:file:{tag}_{nanos}_{seq}?mode=memory&cache=shared");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to open in-memory SQLite pool");

    let db = Database::from_pool(pool);
    db.migrate().await.expect("migrations failed");
    db
}

/// Create a file-backed database, as the service runs in production.
/// The `NamedTempFile` guard must outlive the returned pool.
pub async fn make_file_db() -> (Database, tempfile::NamedTempFile) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", file.path().display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to open file-backed SQLite pool");

    let db = Database::from_pool(pool);
    db.migrate().await.expect("migrations failed");
    (db, file)
}

/// Serve `app` on an OS-assigned port; returns the join handle and port.
pub async fn spawn_test_server(app: Router) -> (tokio::task::JoinHandle<()>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the acceptor a moment to come up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (server, port)
}

/// A keeper configuration tuned for fast tests: tight polling, no jitter.
pub fn fast_keeper_config() -> skyproof::config::KeeperConfig {
    skyproof::config::KeeperConfig {
        poll_interval_ms: 50,
        batch_size: 4,
        worker_count: 2,
        lease_ms: 5_000,
        max_attempts: 3,
        backoff_base_ms: 10,
        backoff_cap_exp: 3,
        backoff_max_ms: 100,
        backoff_jitter_ms: 0,
        finality_poll_ms: 10,
        finality_budget_ms: 2_000,
    }
}
