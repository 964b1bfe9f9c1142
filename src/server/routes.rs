/// REST API routes for evidence submission and status.
///
/// Submission only records intent: the digest lands in the store as a
/// pending job and the keeper anchors it asynchronously. Reads return the
/// best-known status promptly and never block on ledger finality.
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::SkyproofError;
use crate::store::models::{EvidenceJob, JobStatus};
use crate::store::repository;

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a store/gateway error onto the HTTP contract.
pub fn status_for(err: &SkyproofError) -> StatusCode {
    match err {
        SkyproofError::Validation(_) => StatusCode::BAD_REQUEST,
        SkyproofError::NotFound(_) => StatusCode::NOT_FOUND,
        SkyproofError::Conflict(_) => StatusCode::CONFLICT,
        SkyproofError::Unavailable(_) | SkyproofError::TransientBackend(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ─── Health ──────────────────────────────────────────────

/// GET /health
async fn health() -> &'static str {
    "OK"
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Evidence ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EvidenceIn {
    /// Client-supplied id; generated when absent.
    id: Option<String>,
    /// sha-256 digest, 64 hex chars.
    digest_hex: String,
    payload_mime: Option<String>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct EvidenceOut {
    pub id: String,
    pub digest_hex: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

impl From<EvidenceJob> for EvidenceOut {
    fn from(job: EvidenceJob) -> Self {
        Self {
            id: job.id,
            digest_hex: job.digest_hex,
            status: job.status,
            attempts: job.attempts,
            last_error: job.last_error,
            created_ms: job.created_ms,
            updated_ms: job.updated_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EvidencePage {
    data: Vec<EvidenceOut>,
    page: i64,
    per_page: i64,
    total: i64,
}

fn validate_digest(digest_hex: &str) -> Result<String, String> {
    let digest = digest_hex.trim().to_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest_hex must be 64 hexadecimal characters (sha-256)".to_string());
    }
    Ok(digest)
}

/// POST /evidence — queue a digest for anchoring.
async fn post_evidence(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EvidenceIn>,
) -> Result<(StatusCode, Json<EvidenceOut>), (StatusCode, Json<ErrorResponse>)> {
    let digest = validate_digest(&body.digest_hex)
        .map_err(|msg| error_response(StatusCode::BAD_REQUEST, msg))?;

    if let Some(id) = &body.id {
        if id.trim().is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "id must not be empty",
            ));
        }
    }

    let job = repository::insert_job(
        state.db.pool(),
        repository::NewJob {
            id: body.id,
            digest_hex: &digest,
            payload_mime: body.payload_mime.as_deref(),
            metadata: body.metadata.as_ref(),
        },
    )
    .await
    .map_err(|e| error_response(status_for(&e), e.to_string()))?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

/// GET /evidence — newest-first paginated listing.
async fn list_evidence(
    State(state): State<Arc<AppState>>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<EvidencePage>, (StatusCode, Json<ErrorResponse>)> {
    let page = pagination.page.unwrap_or(1).max(1);
    let per_page = pagination.per_page.unwrap_or(10).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let (jobs, total) = repository::list_jobs(state.db.pool(), per_page, offset)
        .await
        .map_err(|e| error_response(status_for(&e), e.to_string()))?;

    Ok(Json(EvidencePage {
        data: jobs.into_iter().map(EvidenceOut::from).collect(),
        page,
        per_page,
        total,
    }))
}

/// GET /evidence/{id}
async fn get_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EvidenceOut>, (StatusCode, Json<ErrorResponse>)> {
    let job = repository::get_job(state.db.pool(), &id)
        .await
        .map_err(|e| error_response(status_for(&e), e.to_string()))?;

    match job {
        Some(job) => Ok(Json(job.into())),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("evidence '{id}' not found"),
        )),
    }
}

pub fn evidence_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/evidence", post(post_evidence).get(list_evidence))
        .route("/evidence/{id}", get(get_evidence))
}
