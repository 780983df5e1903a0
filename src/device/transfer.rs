/// Moving trust from a verified device to a new one
use crate::{
    crypto::{
        codes::{self, TRANSFER_CODE_DIGITS},
        TokenService,
    },
    db::device::{DeviceStatus, DeviceTransferRequest, DeviceTrust},
    device::{
        fingerprint::{self, DeviceAttributes},
        manager::unique_as_conflict,
        DeviceManager,
    },
    error::{GateError, GateResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

const TRANSFER_COLUMNS: &str =
    "id, user_id, old_device_id, new_device_id, code_hash, status, expires_at, created_at, completed_at";

/// Shown on the old device, typed on the new one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInitiated {
    pub transfer_id: String,
    pub transfer_code: String,
    pub expires_at: DateTime<Utc>,
}

/// The new device's credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCompleted {
    pub device_id: String,
    pub device_trust_token: String,
    pub token_expires_at: DateTime<Utc>,
}

pub struct TransferManager {
    db: SqlitePool,
    devices: Arc<DeviceManager>,
    tokens: Arc<TokenService>,
    code_ttl: Duration,
}

impl TransferManager {
    pub fn new(
        db: SqlitePool,
        devices: Arc<DeviceManager>,
        tokens: Arc<TokenService>,
        code_ttl_minutes: i64,
    ) -> Self {
        Self {
            db,
            devices,
            tokens,
            code_ttl: Duration::minutes(code_ttl_minutes),
        }
    }

    /// Issue a one-time code from the currently verified device
    pub async fn initiate(&self, device: &DeviceTrust) -> GateResult<TransferInitiated> {
        if device.status != DeviceStatus::Active {
            return Err(GateError::DeviceTrustInvalid);
        }

        let now = Utc::now();
        let code = codes::generate_numeric_code(TRANSFER_CODE_DIGITS);
        let transfer_id = Uuid::new_v4().to_string();
        let expires_at = now + self.code_ttl;

        let mut tx = self.db.begin().await?;

        // A new code supersedes any outstanding one
        sqlx::query(
            "UPDATE device_transfer_request SET status = 'expired'
             WHERE old_device_id = ? AND status = 'pending'",
        )
        .bind(&device.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO device_transfer_request (id, user_id, old_device_id, code_hash, status, expires_at, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&transfer_id)
        .bind(&device.user_id)
        .bind(&device.id)
        .bind(codes::hash_secret(&code))
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!("Transfer {} initiated from device {}", transfer_id, device.id);

        Ok(TransferInitiated {
            transfer_id,
            transfer_code: code,
            expires_at,
        })
    }

    /// Redeem a code from the new device
    ///
    /// Atomically revokes the old record, creates the new active record and
    /// consumes the request. Unknown, used and expired codes are indistinguishable.
    pub async fn complete(
        &self,
        user_id: &str,
        code: &str,
        attrs: &DeviceAttributes,
    ) -> GateResult<TransferCompleted> {
        attrs
            .validate()
            .map_err(|e| GateError::Validation(e.to_string()))?;

        let now = Utc::now();
        let pending = sqlx::query_as::<_, DeviceTransferRequest>(&format!(
            "SELECT {} FROM device_transfer_request WHERE user_id = ? AND status = 'pending'",
            TRANSFER_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        let request = pending
            .into_iter()
            .find(|r| codes::verify_secret(code, &r.code_hash))
            .ok_or_else(|| {
                tracing::warn!("Transfer code mismatch for user {}", user_id);
                GateError::TransferCodeInvalidOrExpired
            })?;

        if request.expires_at <= now {
            self.mark_expired(&request.id).await?;
            return Err(GateError::TransferCodeInvalidOrExpired);
        }

        let old = self
            .devices
            .get(&request.old_device_id)
            .await?
            .filter(|d| d.status == DeviceStatus::Active)
            .ok_or(GateError::TransferCodeInvalidOrExpired)?;

        let new_fingerprint = fingerprint::fingerprint(attrs);
        if new_fingerprint == old.device_fingerprint {
            tracing::warn!("Transfer {} redeemed from the originating device", request.id);
            return Err(GateError::TransferCodeInvalidOrExpired);
        }

        let new_device_id = Uuid::new_v4().to_string();
        let token_expires_at = now + self.tokens.device_ttl();
        let token = self
            .tokens
            .issue_device_token(user_id, &new_device_id, &new_fingerprint, now, token_expires_at)
            .ok_or_else(|| GateError::Internal("Failed to sign device trust token".to_string()))?;

        let mut tx = self.db.begin().await?;

        let revoked = sqlx::query(
            "UPDATE device_trust SET status = 'revoked', revoked_at = ?, revoked_by = ?, revoke_reason = 'transferred'
             WHERE id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(user_id)
        .bind(&old.id)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(GateError::TransferCodeInvalidOrExpired);
        }

        sqlx::query(
            "INSERT INTO device_trust
             (id, user_id, tenant_id, user_type, device_fingerprint, platform, device_model,
              claimed_phone, verified_phone, status, token_hash, token_issued_at, token_expires_at,
              token_delivered, verified_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, 1, ?, ?)",
        )
        .bind(&new_device_id)
        .bind(user_id)
        .bind(&old.tenant_id)
        .bind(&old.user_type)
        .bind(&new_fingerprint)
        .bind(attrs.platform.trim().to_lowercase())
        .bind(&attrs.model)
        .bind(&old.claimed_phone)
        .bind(&old.verified_phone)
        .bind(codes::hash_secret(&token))
        .bind(now)
        .bind(token_expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unique_as_conflict)?;

        let completed = sqlx::query(
            "UPDATE device_transfer_request SET status = 'completed', new_device_id = ?, completed_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&new_device_id)
        .bind(now)
        .bind(&request.id)
        .execute(&mut *tx)
        .await?;

        if completed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(GateError::TransferCodeInvalidOrExpired);
        }

        tx.commit().await?;

        metrics::record_device_transition("transferred");
        tracing::info!(
            "User {} transferred trust from device {} to {}",
            user_id,
            old.id,
            new_device_id
        );

        Ok(TransferCompleted {
            device_id: new_device_id,
            device_trust_token: token,
            token_expires_at,
        })
    }

    async fn mark_expired(&self, request_id: &str) -> GateResult<()> {
        sqlx::query("UPDATE device_transfer_request SET status = 'expired' WHERE id = ? AND status = 'pending'")
            .bind(request_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Expire pending requests past their deadline
    pub async fn expire_stale(&self) -> GateResult<u64> {
        let result = sqlx::query(
            "UPDATE device_transfer_request SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
