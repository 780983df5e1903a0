/// Scan endpoints
///
/// The engine runs the security chain itself because the level a scan needs
/// depends on the action point, which is only known once the body is read.
use crate::{
    context::AppContext,
    db::scan::{QrScanLog, ScanOutcome},
    error::{GateError, GateResult},
    scan::{IdentityScanRequest, LocationScanRequest, ScanReceipt},
    security::{Authenticated, RequestCredentials, Secured},
};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

const DEFAULT_HISTORY_LIMIT: i64 = 50;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/scan/identity", post(scan_identity))
        .route("/scan/location", post(scan_location))
        .route("/scan/history", get(history))
}

/// Duplicates are logged but surface to the caller as a rejection
fn into_response(receipt: ScanReceipt) -> GateResult<Json<ScanReceipt>> {
    if receipt.outcome == ScanOutcome::Duplicate {
        return Err(GateError::DuplicateScanRejected);
    }
    Ok(Json(receipt))
}

/// Mode A: a scanner device reads a person's identity QR
async fn scan_identity(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<IdentityScanRequest>,
) -> GateResult<Json<ScanReceipt>> {
    let creds = RequestCredentials::from_headers(&headers);
    into_response(ctx.scan_engine.scan_identity(&creds, req).await?)
}

/// Mode B: the person's device reads a location QR
async fn scan_location(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<LocationScanRequest>,
) -> GateResult<Json<ScanReceipt>> {
    let creds = RequestCredentials::from_headers(&headers);
    into_response(ctx.scan_engine.scan_location(&creds, req).await?)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    scans: Vec<QrScanLog>,
}

async fn history(
    State(ctx): State<AppContext>,
    auth: Secured<Authenticated>,
    Query(query): Query<HistoryQuery>,
) -> GateResult<Json<HistoryResponse>> {
    let identity = auth.identity()?;
    let scans = ctx
        .scan_engine
        .history(&identity.user_id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await?;
    Ok(Json(HistoryResponse { scans }))
}
