/// Device registration, trust and transfer endpoints
use crate::{
    context::AppContext,
    crypto::IdentityToken,
    db::device::DeviceTrust,
    device::{
        DeviceAttributes, DeviceStatusView, RegisterDevice, RegistrationChallenge,
        TransferCompleted, TransferInitiated,
    },
    error::GateResult,
    security::{Authenticated, DeviceVerified, Secured},
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

/// Build device routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/device/register", post(register))
        .route("/device/resend-sms", post(resend_sms))
        .route("/device/status", get(status))
        .route("/device/qr-token", post(qr_token))
        .route("/device/transfer/initiate", post(initiate_transfer))
        .route("/device/transfer/complete", post(complete_transfer))
        .route("/device/revoke", delete(revoke))
}

/// Start SMS verification for a new device
async fn register(
    State(ctx): State<AppContext>,
    auth: Secured<Authenticated>,
    Json(req): Json<RegisterDevice>,
) -> GateResult<(StatusCode, Json<RegistrationChallenge>)> {
    let identity = auth.identity()?;
    let challenge = ctx
        .device_manager
        .register(&identity.user_id, &identity.tenant_id, &identity.user_type, req)
        .await?;

    Ok((StatusCode::CREATED, Json(challenge)))
}

#[derive(Debug, Deserialize)]
struct DeviceRef {
    device_id: String,
}

async fn resend_sms(
    State(ctx): State<AppContext>,
    auth: Secured<Authenticated>,
    Json(req): Json<DeviceRef>,
) -> GateResult<Json<RegistrationChallenge>> {
    let identity = auth.identity()?;
    let challenge = ctx
        .device_manager
        .resend(&identity.user_id, &req.device_id)
        .await?;
    Ok(Json(challenge))
}

/// Poll verification status; carries the trust token exactly once
async fn status(
    State(ctx): State<AppContext>,
    auth: Secured<Authenticated>,
    Query(query): Query<DeviceRef>,
) -> GateResult<Json<DeviceStatusView>> {
    let identity = auth.identity()?;
    let view = ctx
        .device_manager
        .status(&identity.user_id, &query.device_id)
        .await?;
    Ok(Json(view))
}

/// Mint a fresh identity QR for display on the trusted device
async fn qr_token(
    State(ctx): State<AppContext>,
    auth: Secured<DeviceVerified>,
) -> GateResult<Json<IdentityToken>> {
    let token = ctx.device_manager.mint_identity_token(auth.device()?)?;
    Ok(Json(token))
}

async fn initiate_transfer(
    State(ctx): State<AppContext>,
    auth: Secured<DeviceVerified>,
) -> GateResult<(StatusCode, Json<TransferInitiated>)> {
    let initiated = ctx.transfer_manager.initiate(auth.device()?).await?;
    Ok((StatusCode::CREATED, Json(initiated)))
}

#[derive(Debug, Deserialize)]
struct CompleteTransferRequest {
    transfer_code: String,
    device: DeviceAttributes,
}

/// Redeem a transfer code on the new device
async fn complete_transfer(
    State(ctx): State<AppContext>,
    auth: Secured<Authenticated>,
    Json(req): Json<CompleteTransferRequest>,
) -> GateResult<Json<TransferCompleted>> {
    let identity = auth.identity()?;
    let completed = ctx
        .transfer_manager
        .complete(&identity.user_id, &req.transfer_code, &req.device)
        .await?;
    Ok(Json(completed))
}

#[derive(Debug, Deserialize)]
struct RevokeQuery {
    reason: Option<String>,
}

async fn revoke(
    State(ctx): State<AppContext>,
    auth: Secured<DeviceVerified>,
    Query(query): Query<RevokeQuery>,
) -> GateResult<Json<DeviceTrust>> {
    let identity = auth.identity()?;
    let revoked = ctx
        .device_manager
        .revoke_own(&identity.user_id, query.reason.as_deref())
        .await?;
    Ok(Json(revoked))
}
