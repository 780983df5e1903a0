/// Action point configuration, signed location payloads and key rotation
use crate::{
    crypto::{codes, ActionPointSigner},
    db::scan::{ActionType, QrActionPoint, QrMode, ACTION_POINT_COLUMNS},
    error::{GateError, GateResult},
    security::SecurityLevel,
};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Admin request to create a touchpoint
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewActionPoint {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub action_type: String,
    #[validate(length(min = 1, max = 64))]
    pub location_code: String,
    pub qr_mode: QrMode,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_radius_meters: Option<f64>,
    #[serde(default)]
    #[validate(range(min = 0, max = 1440))]
    pub qr_rotation_minutes: i64,
    #[serde(default)]
    #[validate(range(min = 0, max = 1440))]
    pub duplicate_window_minutes: i64,
    #[serde(default = "default_required_level")]
    pub required_security_level: i64,
    pub active_from: Option<NaiveTime>,
    pub active_until: Option<NaiveTime>,
    /// Weekdays, Monday = 0
    pub active_days: Option<Vec<u32>>,
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,
}

fn default_required_level() -> i64 {
    SecurityLevel::DeviceVerified as i64
}

/// Contents of a printed/displayed location QR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationQrPayload {
    pub action_point_id: String,
    pub action_type: String,
    pub location_code: String,
    pub signature: String,
    /// When the current rotation key is replaced, for rotating points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Why an action point refuses scans right now
pub fn availability(point: &QrActionPoint, local: DateTime<FixedOffset>) -> Result<(), &'static str> {
    if !point.is_active {
        return Err("action_point_inactive");
    }

    if let Some(days) = point.active_days.as_deref().filter(|d| !d.trim().is_empty()) {
        let today = local.weekday().num_days_from_monday();
        let allowed = days
            .split(',')
            .filter_map(|d| d.trim().parse::<u32>().ok())
            .any(|d| d == today);
        if !allowed {
            return Err("outside_active_days");
        }
    }

    let now = local.time();
    let within = match (point.active_from, point.active_until) {
        (Some(from), Some(until)) if from <= until => now >= from && now < until,
        // Window spans midnight
        (Some(from), Some(until)) => now >= from || now < until,
        (Some(from), None) => now >= from,
        (None, Some(until)) => now < until,
        (None, None) => true,
    };
    if !within {
        return Err("outside_active_hours");
    }

    Ok(())
}

pub struct ActionPointManager {
    db: SqlitePool,
    signer: Arc<ActionPointSigner>,
}

impl ActionPointManager {
    pub fn new(db: SqlitePool, signer: Arc<ActionPointSigner>) -> Self {
        Self { db, signer }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        created_by: &str,
        request: NewActionPoint,
    ) -> GateResult<QrActionPoint> {
        request
            .validate()
            .map_err(|e| GateError::Validation(e.to_string()))?;
        let action_type = ActionType::from_str(&request.action_type)?;

        if SecurityLevel::from_i64(request.required_security_level).is_none() {
            return Err(GateError::Validation("Security level must be between 0 and 5".to_string()));
        }

        let geofence = [request.gps_latitude, request.gps_longitude, request.gps_radius_meters];
        let configured = geofence.iter().filter(|v| v.is_some()).count();
        if configured != 0 && configured != 3 {
            return Err(GateError::Validation(
                "Geofence needs latitude, longitude and radius together".to_string(),
            ));
        }
        if let (Some(lat), Some(lon), Some(radius)) =
            (request.gps_latitude, request.gps_longitude, request.gps_radius_meters)
        {
            if crate::scan::geo::GpsPoint::new(lat, lon).is_none() || radius <= 0.0 {
                return Err(GateError::Validation("Invalid geofence".to_string()));
            }
        }

        // An empty window would never open; leave both bounds unset for all day
        if request.active_from.is_some() && request.active_from == request.active_until {
            return Err(GateError::Validation(
                "active_from and active_until must differ".to_string(),
            ));
        }

        let active_days = match &request.active_days {
            Some(days) if days.iter().any(|d| *d > 6) => {
                return Err(GateError::Validation("Weekdays are 0 (Monday) to 6".to_string()));
            }
            Some(days) => Some(
                days.iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            None => None,
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO qr_action_point
             (id, tenant_id, name, action_type, location_code, qr_mode, gps_latitude, gps_longitude,
              gps_radius_meters, qr_rotation_minutes, rotation_key, rotated_at, duplicate_window_minutes,
              required_security_level, active_from, active_until, active_days, linked_entity_type,
              linked_entity_id, is_active, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(&request.name)
        .bind(action_type.as_str())
        .bind(&request.location_code)
        .bind(request.qr_mode)
        .bind(request.gps_latitude)
        .bind(request.gps_longitude)
        .bind(request.gps_radius_meters)
        .bind(request.qr_rotation_minutes)
        .bind(codes::generate_key())
        .bind(now)
        .bind(request.duplicate_window_minutes)
        .bind(request.required_security_level)
        .bind(request.active_from)
        .bind(request.active_until)
        .bind(active_days)
        .bind(&request.linked_entity_type)
        .bind(&request.linked_entity_id)
        .bind(created_by)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return GateError::Conflict(format!(
                        "Location code {} already exists",
                        request.location_code
                    ));
                }
            }
            GateError::Database(e)
        })?;

        tracing::info!(
            "Action point {} ({}) created by {}",
            id,
            action_type.as_str(),
            created_by
        );

        self.get(&id)
            .await?
            .ok_or_else(|| GateError::Internal("Created action point vanished".to_string()))
    }

    pub async fn get(&self, id: &str) -> GateResult<Option<QrActionPoint>> {
        let point = sqlx::query_as::<_, QrActionPoint>(&format!(
            "SELECT {} FROM qr_action_point WHERE id = ?",
            ACTION_POINT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(point)
    }

    /// Point owned by `tenant_id`; other tenants' points read as missing
    pub async fn get_for_tenant(&self, id: &str, tenant_id: &str) -> GateResult<QrActionPoint> {
        self.get(id)
            .await?
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| GateError::NotFound(format!("Action point {}", id)))
    }

    pub async fn list(&self, tenant_id: &str) -> GateResult<Vec<QrActionPoint>> {
        let points = sqlx::query_as::<_, QrActionPoint>(&format!(
            "SELECT {} FROM qr_action_point WHERE tenant_id = ? ORDER BY name",
            ACTION_POINT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;
        Ok(points)
    }

    pub async fn deactivate(&self, id: &str, tenant_id: &str) -> GateResult<()> {
        let result = sqlx::query("UPDATE qr_action_point SET is_active = 0 WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound(format!("Action point {}", id)));
        }
        tracing::info!("Action point {} deactivated", id);
        Ok(())
    }

    /// Payload to render as the location QR for a Mode B point
    pub fn signed_payload(&self, point: &QrActionPoint) -> GateResult<LocationQrPayload> {
        if point.qr_mode != QrMode::ModeB {
            return Err(GateError::Validation(
                "Only location (mode B) points display a signed QR".to_string(),
            ));
        }

        let valid_until = (point.qr_rotation_minutes > 0)
            .then(|| point.rotated_at + Duration::minutes(point.qr_rotation_minutes));

        Ok(LocationQrPayload {
            action_point_id: point.id.clone(),
            action_type: point.action_type.clone(),
            location_code: point.location_code.clone(),
            signature: self.signer.sign(
                &point.id,
                &point.action_type,
                &point.location_code,
                &point.tenant_id,
                &point.rotation_key,
            ),
            valid_until,
        })
    }

    /// Check a presented payload against the point's current key
    pub fn verify_payload(&self, point: &QrActionPoint, payload: &LocationQrPayload) -> bool {
        payload.action_point_id == point.id
            && payload.action_type == point.action_type
            && payload.location_code == point.location_code
            && self.signer.verify(
                &payload.signature,
                &point.id,
                &point.action_type,
                &point.location_code,
                &point.tenant_id,
                &point.rotation_key,
            )
    }

    /// Replace the key of every rotating point whose interval has elapsed
    ///
    /// Each update is conditional on the key it replaces, so overlapping runs
    /// rotate a point at most once per interval.
    pub async fn rotate_due_keys(&self, now: DateTime<Utc>) -> GateResult<u64> {
        let candidates = sqlx::query_as::<_, QrActionPoint>(&format!(
            "SELECT {} FROM qr_action_point WHERE is_active = 1 AND qr_rotation_minutes > 0",
            ACTION_POINT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        let mut rotated = 0;
        for point in candidates {
            if point.rotated_at + Duration::minutes(point.qr_rotation_minutes) > now {
                continue;
            }

            let result = sqlx::query(
                "UPDATE qr_action_point SET rotation_key = ?, rotated_at = ?
                 WHERE id = ? AND rotation_key = ?",
            )
            .bind(codes::generate_key())
            .bind(now)
            .bind(&point.id)
            .bind(&point.rotation_key)
            .execute(&self.db)
            .await?;

            if result.rows_affected() == 1 {
                rotated += 1;
                tracing::debug!("Rotated key of action point {}", point.id);
            }
        }

        Ok(rotated)
    }
}
