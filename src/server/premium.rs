/// Payment-gated premium verification endpoints.
///
/// This path is machine-to-machine only: a payment proof travels in the
/// `X-402-Payment` header, and any request carrying browser-session
/// credentials (a `Cookie` header) is refused outright regardless of the
/// proof. That refusal is a contract, not a convenience.
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::routes::{error_response, status_for, ErrorResponse};
use super::AppState;
use crate::error::SkyproofError;
use crate::store::models::PaymentReceipt;

/// Header carrying the payment proof signature.
pub const X402_PAYMENT_HEADER: &str = "x-402-payment";

#[derive(Debug, Default, Deserialize)]
struct VerifyPremiumRequest {
    /// Evidence the payment unlocks; optional.
    evidence_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentReceiptOut {
    proof_signature: String,
    amount: String,
    token: String,
    payer_wallet: Option<String>,
    consumed_for: Option<String>,
    issued_ms: i64,
}

impl From<PaymentReceipt> for PaymentReceiptOut {
    fn from(receipt: PaymentReceipt) -> Self {
        Self {
            proof_signature: receipt.proof_signature,
            amount: receipt.amount,
            token: receipt.token,
            payer_wallet: receipt.payer_wallet,
            consumed_for: receipt.consumed_for,
            issued_ms: receipt.issued_ms,
        }
    }
}

/// POST /api/v1/evidence/verify-premium
async fn verify_premium(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<VerifyPremiumRequest>>,
) -> Result<Json<PaymentReceiptOut>, (StatusCode, Json<ErrorResponse>)> {
    // Session credentials are never accepted here, even valid ones.
    if headers.contains_key(header::COOKIE) {
        return Err(error_response(
            StatusCode::PAYMENT_REQUIRED,
            "browser sessions are not accepted; present a machine payment proof",
        ));
    }

    let gateway = state.gateway.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "premium verification is not configured",
        )
    })?;

    let proof_signature = headers
        .get(X402_PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            error_response(
                StatusCode::PAYMENT_REQUIRED,
                "payment proof required in X-402-Payment header",
            )
        })?;

    let request = body.map(|Json(r)| r).unwrap_or_default();

    let receipt = gateway
        .verify(proof_signature, request.evidence_id.as_deref())
        .await
        .map_err(|e| {
            // A proof the ledger does not recognize is a payment problem,
            // not a generic bad request.
            let status = match &e {
                SkyproofError::Validation(_) => StatusCode::PAYMENT_REQUIRED,
                _ => status_for(&e),
            };
            error_response(status, e.to_string())
        })?;

    Ok(Json(receipt.into()))
}

#[derive(Debug, Serialize)]
struct X402Status {
    enabled: bool,
    wallet_address: String,
    supported_tokens: Vec<String>,
}

/// GET /api/v1/x402/status
async fn x402_status(State(state): State<Arc<AppState>>) -> Json<X402Status> {
    match &state.gateway {
        Some(gateway) => {
            let policy = gateway.policy();
            Json(X402Status {
                enabled: true,
                wallet_address: policy.wallet_address.clone(),
                supported_tokens: policy.supported_tokens.clone(),
            })
        }
        None => Json(X402Status {
            enabled: false,
            wallet_address: String::new(),
            supported_tokens: Vec::new(),
        }),
    }
}

pub fn premium_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/evidence/verify-premium", post(verify_premium))
        .route("/api/v1/x402/status", get(x402_status))
}
