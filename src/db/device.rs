/// Device trust database models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a device registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum DeviceStatus {
    PendingSmsVerification,
    Active,
    Revoked,
    Expired,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::PendingSmsVerification => "pending_sms_verification",
            DeviceStatus::Active => "active",
            DeviceStatus::Revoked => "revoked",
            DeviceStatus::Expired => "expired",
        }
    }
}

/// One row per device registration attempt
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceTrust {
    pub id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub user_type: String,
    pub device_fingerprint: String,
    pub platform: String,
    pub device_model: Option<String>,
    pub claimed_phone: String,
    pub verified_phone: Option<String>,
    #[serde(skip_serializing)]
    pub verification_code_hash: Option<String>,
    pub verification_expires_at: Option<DateTime<Utc>>,
    pub resend_count: i64,
    pub status: DeviceStatus,
    #[serde(skip_serializing)]
    pub token_hash: Option<String>,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub token_delivered: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub scan_count: i64,
    pub created_at: DateTime<Utc>,
}

impl DeviceTrust {
    /// Fingerprint prefix embedded in tokens
    pub fn fingerprint_prefix(&self) -> &str {
        crate::device::fingerprint::prefix(&self.device_fingerprint)
    }
}

/// Transfer request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Expired,
}

/// Hand-off from an old verified device to a new one
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceTransferRequest {
    pub id: String,
    pub user_id: String,
    pub old_device_id: String,
    pub new_device_id: Option<String>,
    #[serde(skip_serializing)]
    pub code_hash: String,
    pub status: TransferStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Audit record of an admin-initiated reset
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceResetLog {
    pub id: i64,
    pub device_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub admin_id: String,
    pub reason: String,
    pub notes: Option<String>,
    pub supplementary_notes: Option<String>,
    pub reset_at: DateTime<Utc>,
}

/// Column list shared by device trust queries
pub const DEVICE_TRUST_COLUMNS: &str = "id, user_id, tenant_id, user_type, device_fingerprint, \
     platform, device_model, claimed_phone, verified_phone, verification_code_hash, \
     verification_expires_at, resend_count, status, token_hash, token_issued_at, \
     token_expires_at, token_delivered, verified_at, revoked_at, revoked_by, revoke_reason, \
     last_seen_at, scan_count, created_at";
