/// Scan validation engine
///
/// Both scan modes converge on the same checks: action point availability,
/// the point's required security level, the geofence and the duplicate
/// window. Every attempt leaves exactly one row in the scan log, whatever the
/// outcome, including attempts that name an action point that does not exist.
use super::{
    action_points::{self, ActionPointManager, LocationQrPayload},
    geo::GpsPoint,
    handlers::{HandlerRegistry, HandlerReport, ScanEvent},
    locks::ScanLocks,
};
use crate::{
    crypto::{TokenError, TokenService},
    db::scan::{QrActionPoint, QrMode, QrScanLog, ScanOutcome, SCAN_LOG_COLUMNS},
    device::DeviceManager,
    error::{GateError, GateResult},
    metrics,
    security::{RequestCredentials, SecurityChain, SecurityContext, SecurityLevel},
};
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Rejection reason for scans naming an action point that does not exist
pub const UNKNOWN_ACTION_POINT: &str = "unknown_action_point";

/// Longest presented action point id kept in the log
const MAX_PRESENTED_ID_CHARS: usize = 64;

/// Mode A: a scanner reads a person's identity QR
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityScanRequest {
    pub identity_token: String,
    pub action_point_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Mode B: a person's device reads a location QR
#[derive(Debug, Clone, Deserialize)]
pub struct LocationScanRequest {
    pub payload: LocationQrPayload,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// What the engine recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReceipt {
    pub scan_id: String,
    pub outcome: ScanOutcome,
    pub action_point_id: String,
    pub action_type: String,
    pub user_id: String,
    pub scanned_at: DateTime<Utc>,
    pub geo_validated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerReport>,
}

/// Scan attempt state accumulated while validating
#[derive(Debug, Clone)]
struct Attempt {
    tenant_id: String,
    user_id: Option<String>,
    scanner_user_id: Option<String>,
    action_point_id: String,
    action_type: String,
    mode: QrMode,
    gps: Option<GpsPoint>,
    geo_validated: Option<bool>,
    device_validated: bool,
    at: DateTime<Utc>,
}

impl Attempt {
    fn new(point: &QrActionPoint, mode: QrMode, at: DateTime<Utc>) -> Self {
        Self {
            tenant_id: point.tenant_id.clone(),
            user_id: None,
            scanner_user_id: None,
            action_point_id: point.id.clone(),
            action_type: point.action_type.clone(),
            mode,
            gps: None,
            geo_validated: None,
            device_validated: false,
            at,
        }
    }
}

fn body_gps(latitude: Option<f64>, longitude: Option<f64>) -> GateResult<Option<GpsPoint>> {
    match (latitude, longitude) {
        (None, None) => Ok(None),
        (Some(lat), Some(lon)) => GpsPoint::new(lat, lon).map(Some).ok_or(GateError::GeofenceRequired),
        _ => Err(GateError::GeofenceRequired),
    }
}

pub struct ScanEngine {
    db: SqlitePool,
    chain: Arc<SecurityChain>,
    tokens: Arc<TokenService>,
    devices: Arc<DeviceManager>,
    action_points: Arc<ActionPointManager>,
    handlers: Arc<HandlerRegistry>,
    locks: ScanLocks,
    local_offset: FixedOffset,
}

impl ScanEngine {
    pub fn new(
        db: SqlitePool,
        chain: Arc<SecurityChain>,
        tokens: Arc<TokenService>,
        devices: Arc<DeviceManager>,
        action_points: Arc<ActionPointManager>,
        handlers: Arc<HandlerRegistry>,
        local_utc_offset_minutes: i32,
    ) -> Self {
        let local_offset =
            FixedOffset::east_opt(local_utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self {
            db,
            chain,
            tokens,
            devices,
            action_points,
            handlers,
            locks: ScanLocks::default(),
            local_offset,
        }
    }

    pub async fn scan_identity(
        &self,
        creds: &RequestCredentials,
        request: IdentityScanRequest,
    ) -> GateResult<ScanReceipt> {
        self.scan_identity_at(creds, request, Utc::now()).await
    }

    /// Mode A with an explicit scan time
    pub async fn scan_identity_at(
        &self,
        creds: &RequestCredentials,
        request: IdentityScanRequest,
        at: DateTime<Utc>,
    ) -> GateResult<ScanReceipt> {
        let Some(point) = self.action_points.get(&request.action_point_id).await? else {
            return Err(self
                .reject_unknown_point(creds, &request.action_point_id, QrMode::ModeA, at)
                .await);
        };
        let mut attempt = Attempt::new(&point, QrMode::ModeA, at);

        match self.validate_identity(&point, creds, &request, &mut attempt).await {
            Ok(()) => self.record(&point, attempt).await,
            Err(e) => Err(self.reject(attempt, e).await),
        }
    }

    pub async fn scan_location(
        &self,
        creds: &RequestCredentials,
        request: LocationScanRequest,
    ) -> GateResult<ScanReceipt> {
        self.scan_location_at(creds, request, Utc::now()).await
    }

    /// Mode B with an explicit scan time
    pub async fn scan_location_at(
        &self,
        creds: &RequestCredentials,
        request: LocationScanRequest,
        at: DateTime<Utc>,
    ) -> GateResult<ScanReceipt> {
        let Some(point) = self.action_points.get(&request.payload.action_point_id).await? else {
            return Err(self
                .reject_unknown_point(creds, &request.payload.action_point_id, QrMode::ModeB, at)
                .await);
        };
        let mut attempt = Attempt::new(&point, QrMode::ModeB, at);

        match self.validate_location(&point, creds, &request, &mut attempt).await {
            Ok(()) => self.record(&point, attempt).await,
            Err(e) => Err(self.reject(attempt, e).await),
        }
    }

    async fn validate_identity(
        &self,
        point: &QrActionPoint,
        creds: &RequestCredentials,
        request: &IdentityScanRequest,
        attempt: &mut Attempt,
    ) -> GateResult<()> {
        if point.qr_mode != QrMode::ModeA {
            return Err(GateError::ScanRejected("wrong_qr_mode".to_string()));
        }
        attempt.gps = body_gps(request.latitude, request.longitude)?;

        // The scanning device must itself be trusted
        let mut ctx = self.chain.enforce(SecurityLevel::DeviceVerified, creds).await?;
        attempt.scanner_user_id = ctx.user_id().map(str::to_string);
        if ctx.tenant_id() != Some(point.tenant_id.as_str()) {
            return Err(GateError::ScanRejected("tenant_mismatch".to_string()));
        }

        let claims = self
            .tokens
            .validate_identity_token(&request.identity_token)
            .map_err(|e| match e {
                TokenError::Expired => GateError::QrTokenExpired,
                TokenError::Invalid => GateError::QrTokenInvalid,
            })?;
        attempt.user_id = Some(claims.sub.clone());

        if !TokenService::identity_matches_tenant(&claims, &point.tenant_id) {
            return Err(GateError::QrTokenInvalid);
        }

        let subject_device = self
            .devices
            .active_for_user(&claims.sub)
            .await?
            .ok_or(GateError::DeviceTrustInvalid)?;
        if subject_device.fingerprint_prefix() != claims.dfp {
            tracing::warn!(
                "Identity QR for {} was minted on a device other than its active one",
                claims.sub
            );
            return Err(GateError::DeviceTrustInvalid);
        }
        attempt.device_validated = true;

        // A verified identity QR is the level 3 proof for this scan
        ctx.qr = Some(claims);
        ctx.cleared = ctx.cleared.max(SecurityLevel::QrSecured);

        self.shared_checks(point, ctx, creds, attempt).await
    }

    async fn validate_location(
        &self,
        point: &QrActionPoint,
        creds: &RequestCredentials,
        request: &LocationScanRequest,
        attempt: &mut Attempt,
    ) -> GateResult<()> {
        if point.qr_mode != QrMode::ModeB {
            return Err(GateError::ScanRejected("wrong_qr_mode".to_string()));
        }
        if !self.action_points.verify_payload(point, &request.payload) {
            return Err(GateError::LocationSignatureMismatch);
        }
        attempt.gps = body_gps(request.latitude, request.longitude)?;

        let ctx = self.chain.enforce(SecurityLevel::DeviceVerified, creds).await?;
        attempt.user_id = ctx.user_id().map(str::to_string);
        attempt.device_validated = ctx.device.is_some();
        if ctx.tenant_id() != Some(point.tenant_id.as_str()) {
            return Err(GateError::ScanRejected("tenant_mismatch".to_string()));
        }

        self.shared_checks(point, ctx, creds, attempt).await
    }

    async fn shared_checks(
        &self,
        point: &QrActionPoint,
        ctx: SecurityContext,
        creds: &RequestCredentials,
        attempt: &mut Attempt,
    ) -> GateResult<()> {
        action_points::availability(point, attempt.at.with_timezone(&self.local_offset))
            .map_err(|reason| GateError::ScanRejected(reason.to_string()))?;

        let ctx = self.chain.advance(ctx, point.required_level(), creds).await?;
        if attempt.gps.is_none() {
            attempt.gps = ctx.gps;
        }

        if let Some((lat, lon, radius)) = point.geofence() {
            let center = GpsPoint::new(lat, lon)
                .ok_or_else(|| GateError::Internal(format!("Action point {} has a bad geofence", point.id)))?;
            let position = attempt.gps.ok_or(GateError::GeofenceRequired)?;
            let inside = position.within(&center, radius);
            attempt.geo_validated = Some(inside);
            if !inside {
                return Err(GateError::GeofenceViolation);
            }
        }

        Ok(())
    }

    /// Record a validated attempt, classifying it against the duplicate window
    async fn record(&self, point: &QrActionPoint, attempt: Attempt) -> GateResult<ScanReceipt> {
        let user_id = attempt
            .user_id
            .clone()
            .ok_or_else(|| GateError::Internal("Validated scan without a subject".to_string()))?;
        let action = point.action()?;
        let scan_id = Uuid::new_v4().to_string();
        let window_start = attempt.at - Duration::minutes(point.duplicate_window_minutes.max(0));

        let guard = self
            .locks
            .acquire(&format!("{}:{}", user_id, point.action_type))
            .await;

        // Classification and insert happen in one statement
        let outcome: ScanOutcome = sqlx::query_scalar(
            "INSERT INTO qr_scan_log
             (id, tenant_id, user_id, scanner_user_id, action_point_id, action_type, qr_mode,
              validation_result, rejection_reason, gps_latitude, gps_longitude, geo_validated,
              device_validated, scanned_at)
             SELECT ?, ?, ?, ?, ?, ?, ?,
                    CASE WHEN EXISTS (
                        SELECT 1 FROM qr_scan_log
                        WHERE user_id = ? AND action_type = ? AND validation_result = 'success'
                          AND scanned_at > ? AND scanned_at <= ?
                    ) THEN 'duplicate' ELSE 'success' END,
                    NULL, ?, ?, ?, ?, ?
             RETURNING validation_result",
        )
        .bind(&scan_id)
        .bind(&attempt.tenant_id)
        .bind(&user_id)
        .bind(&attempt.scanner_user_id)
        .bind(&attempt.action_point_id)
        .bind(&attempt.action_type)
        .bind(attempt.mode)
        .bind(&user_id)
        .bind(&attempt.action_type)
        .bind(window_start)
        .bind(attempt.at)
        .bind(attempt.gps.map(|g| g.latitude))
        .bind(attempt.gps.map(|g| g.longitude))
        .bind(attempt.geo_validated)
        .bind(attempt.device_validated)
        .bind(attempt.at)
        .fetch_one(&self.db)
        .await?;

        drop(guard);

        metrics::record_scan(&attempt.action_type, outcome.as_str());

        let mut receipt = ScanReceipt {
            scan_id: scan_id.clone(),
            outcome,
            action_point_id: attempt.action_point_id.clone(),
            action_type: attempt.action_type.clone(),
            user_id: user_id.clone(),
            scanned_at: attempt.at,
            geo_validated: attempt.geo_validated,
            handler: None,
        };

        if outcome == ScanOutcome::Duplicate {
            tracing::info!(
                "Duplicate {} scan by {} at {}",
                attempt.action_type,
                user_id,
                attempt.action_point_id
            );
            return Ok(receipt);
        }

        if let Err(e) = self.devices.record_scan(&user_id).await {
            tracing::warn!("Failed to update scan counter for {}: {}", user_id, e);
        }

        let event = ScanEvent {
            scan_id,
            user_id,
            tenant_id: attempt.tenant_id,
            action_point_id: attempt.action_point_id,
            action_type: action,
            linked_entity_type: point.linked_entity_type.clone(),
            linked_entity_id: point.linked_entity_id.clone(),
            scanned_at: attempt.at,
            local_time: attempt.at.with_timezone(&self.local_offset),
        };
        receipt.handler = Some(self.handlers.dispatch(&event).await);

        Ok(receipt)
    }

    /// Log a rejected attempt and hand the error back
    async fn reject(&self, attempt: Attempt, error: GateError) -> GateError {
        let reason = error.rejection_reason();

        let logged = sqlx::query(
            "INSERT INTO qr_scan_log
             (id, tenant_id, user_id, scanner_user_id, action_point_id, action_type, qr_mode,
              validation_result, rejection_reason, gps_latitude, gps_longitude, geo_validated,
              device_validated, scanned_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'rejected', ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&attempt.tenant_id)
        .bind(&attempt.user_id)
        .bind(&attempt.scanner_user_id)
        .bind(&attempt.action_point_id)
        .bind(&attempt.action_type)
        .bind(attempt.mode)
        .bind(&reason)
        .bind(attempt.gps.map(|g| g.latitude))
        .bind(attempt.gps.map(|g| g.longitude))
        .bind(attempt.geo_validated)
        .bind(attempt.device_validated)
        .bind(attempt.at)
        .execute(&self.db)
        .await;

        if let Err(e) = logged {
            tracing::error!("Failed to log rejected scan at {}: {}", attempt.action_point_id, e);
        }

        metrics::record_scan(&attempt.action_type, ScanOutcome::Rejected.as_str());
        tracing::warn!(
            "Rejected {} scan at {}: {}",
            attempt.action_type,
            attempt.action_point_id,
            reason
        );
        error
    }

    /// Log an attempt against an action point id that does not exist
    ///
    /// The caller is attributed from the session when it validates; the
    /// scanner in mode A, the subject in mode B.
    async fn reject_unknown_point(
        &self,
        creds: &RequestCredentials,
        presented_id: &str,
        mode: QrMode,
        at: DateTime<Utc>,
    ) -> GateError {
        let caller = self.chain.enforce(SecurityLevel::Authenticated, creds).await.ok();
        let tenant_id = caller.as_ref().and_then(|c| c.tenant_id()).map(str::to_string);
        let caller_id = caller.as_ref().and_then(|c| c.user_id()).map(str::to_string);
        let (user_id, scanner_user_id) = match mode {
            QrMode::ModeA => (None, caller_id),
            QrMode::ModeB => (caller_id, None),
        };
        let presented: String = presented_id.chars().take(MAX_PRESENTED_ID_CHARS).collect();

        let logged = sqlx::query(
            "INSERT INTO qr_scan_log
             (id, tenant_id, user_id, scanner_user_id, action_point_id, action_type, qr_mode,
              validation_result, rejection_reason, device_validated, scanned_at)
             VALUES (?, ?, ?, ?, ?, NULL, ?, 'rejected', ?, 0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&tenant_id)
        .bind(&user_id)
        .bind(&scanner_user_id)
        .bind(&presented)
        .bind(mode)
        .bind(UNKNOWN_ACTION_POINT)
        .bind(at)
        .execute(&self.db)
        .await;

        if let Err(e) = logged {
            tracing::error!("Failed to log scan at unknown action point {}: {}", presented, e);
        }

        metrics::record_scan("unknown", ScanOutcome::Rejected.as_str());
        tracing::warn!("Rejected scan at unknown action point {}", presented);
        GateError::NotFound(format!("Action point {}", presented))
    }

    /// A user's own scan history, newest first
    pub async fn history(&self, user_id: &str, limit: i64) -> GateResult<Vec<QrScanLog>> {
        let logs = sqlx::query_as::<_, QrScanLog>(&format!(
            "SELECT {} FROM qr_scan_log WHERE user_id = ? ORDER BY scanned_at DESC LIMIT ?",
            SCAN_LOG_COLUMNS
        ))
        .bind(user_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.db)
        .await?;
        Ok(logs)
    }
}
