/// Admin device resets and the repeat-reset fraud signal
use crate::{
    db::device::DeviceResetLog,
    device::DeviceManager,
    error::{GateError, GateResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

const RESET_LOG_COLUMNS: &str =
    "id, device_id, tenant_id, user_id, admin_id, reason, notes, supplementary_notes, reset_at";

/// Why an admin wiped a user's device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    LostDevice,
    StolenDevice,
    DeviceReplaced,
    SuspectedFraud,
    Other,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::LostDevice => "lost_device",
            ResetReason::StolenDevice => "stolen_device",
            ResetReason::DeviceReplaced => "device_replaced",
            ResetReason::SuspectedFraud => "suspected_fraud",
            ResetReason::Other => "other",
        }
    }
}

/// A user reset often enough to warrant review
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct FlaggedUser {
    pub tenant_id: String,
    pub user_id: String,
    pub reset_count: i64,
    pub last_reset_at: DateTime<Utc>,
}

pub struct DeviceResetManager {
    db: SqlitePool,
    devices: Arc<DeviceManager>,
}

impl DeviceResetManager {
    pub fn new(db: SqlitePool, devices: Arc<DeviceManager>) -> Self {
        Self { db, devices }
    }

    /// Revoke a user's active device and record who did it and why
    ///
    /// Only devices registered under `tenant_id` are visible to the admin.
    pub async fn reset_device(
        &self,
        admin_id: &str,
        tenant_id: &str,
        user_id: &str,
        reason: ResetReason,
        notes: Option<String>,
    ) -> GateResult<DeviceResetLog> {
        let device = self
            .devices
            .active_for_user(user_id)
            .await?
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| GateError::NotFound(format!("No active device for user {}", user_id)))?;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let revoked = sqlx::query(
            "UPDATE device_trust SET status = 'revoked', revoked_at = ?, revoked_by = ?, revoke_reason = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(admin_id)
        .bind(format!("admin_reset:{}", reason.as_str()))
        .bind(&device.id)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(GateError::Conflict("Device is no longer active".to_string()));
        }

        let log = sqlx::query_as::<_, DeviceResetLog>(&format!(
            "INSERT INTO device_reset_log (device_id, tenant_id, user_id, admin_id, reason, notes, reset_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            RESET_LOG_COLUMNS
        ))
        .bind(&device.id)
        .bind(&device.tenant_id)
        .bind(user_id)
        .bind(admin_id)
        .bind(reason.as_str())
        .bind(&notes)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::record_device_transition("admin_reset");
        tracing::info!(
            "Admin {} reset device {} of user {} ({})",
            admin_id,
            device.id,
            user_id,
            reason.as_str()
        );

        Ok(log)
    }

    /// Attach supplementary notes; allowed once per entry
    pub async fn append_notes(
        &self,
        tenant_id: &str,
        log_id: i64,
        notes: &str,
    ) -> GateResult<DeviceResetLog> {
        if notes.trim().is_empty() {
            return Err(GateError::Validation("Notes cannot be empty".to_string()));
        }

        let result = sqlx::query(
            "UPDATE device_reset_log SET supplementary_notes = ?
             WHERE id = ? AND tenant_id = ? AND supplementary_notes IS NULL",
        )
        .bind(notes)
        .bind(log_id)
        .bind(tenant_id)
        .execute(&self.db)
        .await?;

        let log = self
            .get(tenant_id, log_id)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("Reset log entry {}", log_id)))?;

        if result.rows_affected() == 0 {
            return Err(GateError::Conflict(
                "Supplementary notes were already recorded".to_string(),
            ));
        }
        Ok(log)
    }

    pub async fn get(&self, tenant_id: &str, log_id: i64) -> GateResult<Option<DeviceResetLog>> {
        let log = sqlx::query_as::<_, DeviceResetLog>(&format!(
            "SELECT {} FROM device_reset_log WHERE id = ? AND tenant_id = ?",
            RESET_LOG_COLUMNS
        ))
        .bind(log_id)
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(log)
    }

    /// Reset history for a user within one tenant, newest first
    pub async fn history(&self, tenant_id: &str, user_id: &str) -> GateResult<Vec<DeviceResetLog>> {
        let logs = sqlx::query_as::<_, DeviceResetLog>(&format!(
            "SELECT {} FROM device_reset_log WHERE tenant_id = ? AND user_id = ?
             ORDER BY reset_at DESC, id DESC",
            RESET_LOG_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(logs)
    }

    /// Users with at least `threshold` resets in the trailing window
    ///
    /// `None` covers every tenant and is meant for the periodic report only.
    pub async fn flagged_users(
        &self,
        tenant_id: Option<&str>,
        window_days: i64,
        threshold: i64,
    ) -> GateResult<Vec<FlaggedUser>> {
        let since = Utc::now() - Duration::days(window_days);
        let flagged = sqlx::query_as::<_, FlaggedUser>(
            "SELECT tenant_id, user_id, COUNT(*) AS reset_count, MAX(reset_at) AS last_reset_at
             FROM device_reset_log
             WHERE reset_at >= ? AND (? IS NULL OR tenant_id = ?)
             GROUP BY tenant_id, user_id
             HAVING COUNT(*) >= ?
             ORDER BY reset_count DESC, user_id",
        )
        .bind(since)
        .bind(tenant_id)
        .bind(tenant_id)
        .bind(threshold)
        .fetch_all(&self.db)
        .await?;
        Ok(flagged)
    }
}
