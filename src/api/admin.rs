/// Admin API Endpoints
///
/// Device resets, fraud review and action point management. Every route
/// requires [`AdminAuthContext`] and is scoped to the admin's tenant.
use crate::{
    auth::AdminAuthContext,
    context::AppContext,
    db::{
        device::{DeviceResetLog, DeviceTrust},
        scan::QrActionPoint,
    },
    device::{FlaggedUser, ResetReason},
    error::{GateError, GateResult},
    scan::{LocationQrPayload, NewActionPoint},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Devices and resets
        .route("/admin/users/:user_id/devices", get(list_user_devices))
        .route("/admin/users/:user_id/device/reset", post(reset_device))
        .route("/admin/resets/:log_id/notes", post(append_reset_notes))
        .route("/admin/flagged-users", get(flagged_users))
        // Action points
        .route("/admin/action-points", post(create_action_point).get(list_action_points))
        .route("/admin/action-points/:id", delete(deactivate_action_point))
        .route("/admin/action-points/:id/qr", get(action_point_qr))
}

#[derive(Debug, Serialize)]
struct UserDevicesResponse {
    devices: Vec<DeviceTrust>,
    resets: Vec<DeviceResetLog>,
}

/// Every device a user registered, with their reset history
async fn list_user_devices(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Path(user_id): Path<String>,
) -> GateResult<Json<UserDevicesResponse>> {
    let devices: Vec<DeviceTrust> = ctx
        .device_manager
        .list_for_user(&user_id)
        .await?
        .into_iter()
        .filter(|d| d.tenant_id == auth.identity.tenant_id)
        .collect();
    let resets = ctx
        .reset_manager
        .history(&auth.identity.tenant_id, &user_id)
        .await?;

    Ok(Json(UserDevicesResponse { devices, resets }))
}

#[derive(Debug, Deserialize)]
struct ResetDeviceRequest {
    reason: ResetReason,
    notes: Option<String>,
}

/// Force-revoke a user's active device
async fn reset_device(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Path(user_id): Path<String>,
    Json(req): Json<ResetDeviceRequest>,
) -> GateResult<Json<DeviceResetLog>> {
    let log = ctx
        .reset_manager
        .reset_device(
            auth.admin_id(),
            &auth.identity.tenant_id,
            &user_id,
            req.reason,
            req.notes,
        )
        .await?;

    tracing::info!(
        "Admin {} reset device {} of {} ({})",
        auth.admin_id(),
        log.device_id,
        user_id,
        log.reason
    );
    Ok(Json(log))
}

#[derive(Debug, Deserialize)]
struct AppendNotesRequest {
    notes: String,
}

async fn append_reset_notes(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Path(log_id): Path<i64>,
    Json(req): Json<AppendNotesRequest>,
) -> GateResult<Json<DeviceResetLog>> {
    let log = ctx
        .reset_manager
        .append_notes(&auth.identity.tenant_id, log_id, &req.notes)
        .await?;
    Ok(Json(log))
}

#[derive(Debug, Deserialize)]
struct FlaggedQuery {
    window_days: Option<i64>,
    threshold: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FlaggedResponse {
    window_days: i64,
    threshold: i64,
    users: Vec<FlaggedUser>,
}

/// Users with repeated admin resets in the trailing window
async fn flagged_users(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Query(query): Query<FlaggedQuery>,
) -> GateResult<Json<FlaggedResponse>> {
    let window_days = query.window_days.unwrap_or(ctx.config.fraud.reset_window_days);
    let threshold = query.threshold.unwrap_or(ctx.config.fraud.reset_threshold);
    if window_days <= 0 || threshold <= 0 {
        return Err(GateError::Validation(
            "window_days and threshold must be positive".to_string(),
        ));
    }

    let users = ctx
        .reset_manager
        .flagged_users(Some(&auth.identity.tenant_id), window_days, threshold)
        .await?;
    Ok(Json(FlaggedResponse {
        window_days,
        threshold,
        users,
    }))
}

async fn create_action_point(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Json(req): Json<NewActionPoint>,
) -> GateResult<(StatusCode, Json<QrActionPoint>)> {
    let point = ctx
        .action_points
        .create(&auth.identity.tenant_id, auth.admin_id(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(point)))
}

#[derive(Debug, Serialize)]
struct ActionPointsResponse {
    action_points: Vec<QrActionPoint>,
}

async fn list_action_points(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
) -> GateResult<Json<ActionPointsResponse>> {
    let action_points = ctx.action_points.list(&auth.identity.tenant_id).await?;
    Ok(Json(ActionPointsResponse { action_points }))
}

async fn deactivate_action_point(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Path(id): Path<String>,
) -> GateResult<StatusCode> {
    ctx.action_points
        .deactivate(&id, &auth.identity.tenant_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current signed payload to print or display at a location
async fn action_point_qr(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    Path(id): Path<String>,
) -> GateResult<Json<LocationQrPayload>> {
    let point = ctx
        .action_points
        .get_for_tenant(&id, &auth.identity.tenant_id)
        .await?;
    Ok(Json(ctx.action_points.signed_payload(&point)?))
}
