/// Device registration, SMS verification and trust token validation
use crate::{
    config::DeviceConfig,
    crypto::{
        codes::{self, VERIFICATION_CODE_DIGITS},
        IdentityToken, TokenError, TokenService,
    },
    db::device::{DeviceStatus, DeviceTrust, DEVICE_TRUST_COLUMNS},
    device::fingerprint::{self, DeviceAttributes},
    error::{GateError, GateResult},
    metrics,
    rate_limit::KeyedLimiter,
    sms::{normalize_phone, IncomingSms, SmsGateway},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

const RESEND_WINDOW: std::time::Duration = std::time::Duration::from_secs(600);

/// Map a violation of the one-active-device index to a conflict
pub(crate) fn unique_as_conflict(e: sqlx::Error) -> GateError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return GateError::Conflict("User already has an active device".to_string());
        }
    }
    GateError::Database(e)
}

/// Registration request from an authenticated user
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterDevice {
    #[validate(length(min = 8, max = 20))]
    pub phone: String,
    #[validate(nested)]
    pub device: DeviceAttributes,
}

/// What the client needs to finish SMS verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationChallenge {
    pub device_id: String,
    pub status: DeviceStatus,
    pub phone: String,
    pub virtual_number: String,
    pub expires_at: DateTime<Utc>,
    pub resends_remaining: i64,
}

/// Result of a status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusView {
    pub device_id: String,
    pub status: DeviceStatus,
    /// Present after activation until the device first uses the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_trust_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// What an incoming SMS did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Activated { device_id: String },
    /// Same gateway message delivered again
    Duplicate,
    Unmatched,
}

/// Device lifecycle manager
pub struct DeviceManager {
    db: SqlitePool,
    tokens: Arc<TokenService>,
    gateway: Arc<dyn SmsGateway>,
    config: DeviceConfig,
    otp_template_id: String,
    resend_limiter: KeyedLimiter,
}

impl DeviceManager {
    pub fn new(
        db: SqlitePool,
        tokens: Arc<TokenService>,
        gateway: Arc<dyn SmsGateway>,
        config: DeviceConfig,
        otp_template_id: String,
    ) -> Self {
        let resend_limiter = KeyedLimiter::new(config.resend_quota, RESEND_WINDOW);
        Self {
            db,
            tokens,
            gateway,
            config,
            otp_template_id,
            resend_limiter,
        }
    }

    /// Start a registration: record a pending device and send the code
    pub async fn register(
        &self,
        user_id: &str,
        tenant_id: &str,
        user_type: &str,
        request: RegisterDevice,
    ) -> GateResult<RegistrationChallenge> {
        request
            .validate()
            .map_err(|e| GateError::Validation(e.to_string()))?;
        let phone = normalize_phone(&request.phone)?;

        if self.active_for_user(user_id).await?.is_some() {
            return Err(GateError::Conflict(
                "An active device is already registered; use device transfer".to_string(),
            ));
        }

        let now = Utc::now();

        // Only the newest pending registration can be verified
        sqlx::query(
            "UPDATE device_trust SET status = 'expired', verification_code_hash = NULL
             WHERE user_id = ? AND status = 'pending_sms_verification'",
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;

        let device_id = Uuid::new_v4().to_string();
        let code = codes::generate_numeric_code(VERIFICATION_CODE_DIGITS);
        let expires_at = now + Duration::minutes(self.config.verification_code_ttl_minutes);

        sqlx::query(
            "INSERT INTO device_trust
             (id, user_id, tenant_id, user_type, device_fingerprint, platform, device_model,
              claimed_phone, verification_code_hash, verification_expires_at, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending_sms_verification', ?)",
        )
        .bind(&device_id)
        .bind(user_id)
        .bind(tenant_id)
        .bind(user_type)
        .bind(fingerprint::fingerprint(&request.device))
        .bind(request.device.platform.trim().to_lowercase())
        .bind(&request.device.model)
        .bind(&phone)
        .bind(codes::hash_secret(&code))
        .bind(expires_at)
        .bind(now)
        .execute(&self.db)
        .await?;

        self.send_code(&phone, &code).await?;

        metrics::record_device_transition("registered");
        tracing::info!("Device {} registered for user {}, awaiting SMS", device_id, user_id);

        Ok(RegistrationChallenge {
            device_id,
            status: DeviceStatus::PendingSmsVerification,
            phone,
            virtual_number: self.gateway.virtual_number(),
            expires_at,
            resends_remaining: self.config.max_resends,
        })
    }

    /// Issue a fresh code for a pending registration; the previous code stops working
    pub async fn resend(&self, user_id: &str, device_id: &str) -> GateResult<RegistrationChallenge> {
        self.resend_limiter.check(user_id)?;

        let device = self
            .get(device_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| GateError::NotFound("Device registration not found".to_string()))?;

        if device.status != DeviceStatus::PendingSmsVerification {
            return Err(GateError::Conflict("Device is not awaiting verification".to_string()));
        }
        if device.resend_count >= self.config.max_resends {
            tracing::warn!("Resend cap reached for device {}", device_id);
            return Err(GateError::RateLimited {
                retry_after: RESEND_WINDOW,
            });
        }

        let code = codes::generate_numeric_code(VERIFICATION_CODE_DIGITS);
        let expires_at = Utc::now() + Duration::minutes(self.config.verification_code_ttl_minutes);

        let result = sqlx::query(
            "UPDATE device_trust
             SET verification_code_hash = ?, verification_expires_at = ?, resend_count = resend_count + 1
             WHERE id = ? AND status = 'pending_sms_verification'",
        )
        .bind(codes::hash_secret(&code))
        .bind(expires_at)
        .bind(device_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::Conflict("Device is not awaiting verification".to_string()));
        }

        self.send_code(&device.claimed_phone, &code).await?;
        tracing::info!("Verification code resent for device {}", device_id);

        Ok(RegistrationChallenge {
            device_id: device.id,
            status: DeviceStatus::PendingSmsVerification,
            phone: device.claimed_phone,
            virtual_number: self.gateway.virtual_number(),
            expires_at,
            resends_remaining: self.config.max_resends - device.resend_count - 1,
        })
    }

    async fn send_code(&self, phone: &str, code: &str) -> GateResult<()> {
        match self.gateway.send_otp(phone, code, &self.otp_template_id).await {
            Ok(message_id) => {
                metrics::record_sms("sent");
                tracing::debug!("Verification SMS queued: {}", message_id);
                Ok(())
            }
            Err(e) => {
                metrics::record_sms("send_failed");
                Err(e)
            }
        }
    }

    /// Reconcile a message forwarded to the virtual number
    ///
    /// Idempotent per gateway message id. A code only matches a pending
    /// registration whose claimed phone is the sender. The ledger row and the
    /// activation commit together, so a failed activation leaves the message
    /// unrecorded and a redelivery is processed again.
    pub async fn reconcile_incoming_sms(&self, sms: &IncomingSms) -> GateResult<WebhookOutcome> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO sms_webhook_event (gateway_message_id, sender, received_at)
             VALUES (?, ?, ?)",
        )
        .bind(&sms.gateway_message_id)
        .bind(&sms.sender)
        .bind(sms.received_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            metrics::record_sms("duplicate");
            tracing::info!("Ignoring duplicate SMS delivery {}", sms.gateway_message_id);
            return Ok(WebhookOutcome::Duplicate);
        }

        let matched = self.match_incoming(&mut tx, sms).await?;

        if let Some(device) = &matched {
            sqlx::query("UPDATE sms_webhook_event SET matched_device_id = ? WHERE gateway_message_id = ?")
                .bind(&device.id)
                .bind(&sms.gateway_message_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        match matched {
            Some(device) => {
                metrics::record_sms("matched");
                metrics::record_device_transition("activated");
                tracing::info!("Device {} activated for user {}", device.id, device.user_id);
                Ok(WebhookOutcome::Activated { device_id: device.id })
            }
            None => {
                metrics::record_sms("unmatched");
                Ok(WebhookOutcome::Unmatched)
            }
        }
    }

    /// Find and activate the pending registration this message verifies
    async fn match_incoming(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        sms: &IncomingSms,
    ) -> GateResult<Option<DeviceTrust>> {
        let Ok(sender) = normalize_phone(&sms.sender) else {
            tracing::warn!("Incoming SMS with unusable sender {}", sms.sender);
            return Ok(None);
        };
        let Some(code) = codes::extract_code(&sms.message, VERIFICATION_CODE_DIGITS) else {
            tracing::info!("Incoming SMS from {} carried no verification code", sender);
            return Ok(None);
        };

        let candidates = sqlx::query_as::<_, DeviceTrust>(&format!(
            "SELECT {} FROM device_trust
             WHERE claimed_phone = ? AND status = 'pending_sms_verification'
               AND verification_expires_at > ?",
            DEVICE_TRUST_COLUMNS
        ))
        .bind(&sender)
        .bind(Utc::now())
        .fetch_all(&mut **tx)
        .await?;

        let matched = candidates.into_iter().find(|d| {
            d.verification_code_hash
                .as_deref()
                .is_some_and(|hash| codes::verify_secret(&code, hash))
        });

        match matched {
            Some(device) => {
                self.activate(tx, &device, &sender).await?;
                Ok(Some(device))
            }
            None => {
                tracing::info!("Incoming SMS from {} matched no pending registration", sender);
                Ok(None)
            }
        }
    }

    /// Move a pending record to active and bind its trust token
    async fn activate(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        device: &DeviceTrust,
        verified_phone: &str,
    ) -> GateResult<()> {
        let issued_at = Utc::now();
        let expires_at = issued_at + self.tokens.device_ttl();
        let token = self
            .tokens
            .issue_device_token(&device.user_id, &device.id, &device.device_fingerprint, issued_at, expires_at)
            .ok_or_else(|| GateError::Internal("Failed to sign device trust token".to_string()))?;

        let result = sqlx::query(
            "UPDATE device_trust
             SET status = 'active', verified_phone = ?, verified_at = ?, verification_code_hash = NULL,
                 token_hash = ?, token_issued_at = ?, token_expires_at = ?, token_delivered = 0
             WHERE id = ? AND status = 'pending_sms_verification'",
        )
        .bind(verified_phone)
        .bind(issued_at)
        .bind(codes::hash_secret(&token))
        .bind(issued_at)
        .bind(expires_at)
        .bind(&device.id)
        .execute(&mut **tx)
        .await
        .map_err(unique_as_conflict)?;

        if result.rows_affected() == 0 {
            return Err(GateError::Conflict("Device is not awaiting verification".to_string()));
        }
        Ok(())
    }

    /// Poll registration state
    ///
    /// The trust token is returned to its owner until the device first
    /// presents it, so a lost poll response can simply be retried.
    pub async fn status(&self, user_id: &str, device_id: &str) -> GateResult<DeviceStatusView> {
        let device = self
            .get(device_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| GateError::NotFound("Device registration not found".to_string()))?;

        let device_trust_token = if device.status == DeviceStatus::Active && !device.token_delivered {
            Some(self.reissue_token(&device)?)
        } else {
            None
        };

        Ok(DeviceStatusView {
            device_id: device.id.clone(),
            status: device.status,
            device_trust_token,
            token_expires_at: device.token_expires_at,
        })
    }

    /// Re-sign the token bound to an active record
    ///
    /// Signing is deterministic, so this reproduces the token whose hash was
    /// stored at activation.
    pub(crate) fn reissue_token(&self, device: &DeviceTrust) -> GateResult<String> {
        let (Some(issued_at), Some(expires_at)) = (device.token_issued_at, device.token_expires_at) else {
            return Err(GateError::Internal("Active device has no token window".to_string()));
        };

        let token = self
            .tokens
            .issue_device_token(&device.user_id, &device.id, &device.device_fingerprint, issued_at, expires_at)
            .ok_or_else(|| GateError::Internal("Failed to sign device trust token".to_string()))?;

        match device.token_hash.as_deref() {
            Some(hash) if codes::verify_secret(&token, hash) => Ok(token),
            _ => Err(GateError::Internal("Stored token hash does not match".to_string())),
        }
    }

    /// Resolve a presented Device Trust Token to its active record
    pub async fn verify_device_token(&self, token: &str) -> GateResult<DeviceTrust> {
        let claims = self.tokens.validate_device_token(token).map_err(|e| {
            if e == TokenError::Expired {
                metrics::record_device_transition("token_expired_presented");
            }
            GateError::DeviceTrustInvalid
        })?;

        let device = self.get(&claims.did).await?.ok_or(GateError::DeviceTrustInvalid)?;

        if device.status != DeviceStatus::Active {
            tracing::warn!("Device {} presented token while {}", device.id, device.status.as_str());
            return Err(GateError::DeviceTrustInvalid);
        }
        if device.user_id != claims.sub || device.fingerprint_prefix() != claims.dfp {
            tracing::warn!("Device {} token claims do not match the record", device.id);
            return Err(GateError::DeviceTrustInvalid);
        }
        let hash_matches = device
            .token_hash
            .as_deref()
            .is_some_and(|hash| codes::verify_secret(token, hash));
        if !hash_matches {
            tracing::warn!("Device {} presented a superseded token", device.id);
            return Err(GateError::DeviceTrustInvalid);
        }
        if device.token_expires_at.map_or(true, |exp| exp <= Utc::now()) {
            return Err(GateError::DeviceTrustInvalid);
        }

        // First use proves the token reached the device; polls stop returning it
        sqlx::query("UPDATE device_trust SET last_seen_at = ?, token_delivered = 1 WHERE id = ?")
            .bind(Utc::now())
            .bind(&device.id)
            .execute(&self.db)
            .await?;

        Ok(device)
    }

    /// Mint a rotating identity QR for a verified device
    pub fn mint_identity_token(&self, device: &DeviceTrust) -> GateResult<IdentityToken> {
        self.tokens
            .issue_identity_token(&device.user_id, &device.device_fingerprint, &device.tenant_id, &device.user_type)
            .ok_or_else(|| GateError::Internal("Failed to sign identity token".to_string()))
    }

    /// Revoke the caller's own active device
    pub async fn revoke_own(&self, user_id: &str, reason: Option<&str>) -> GateResult<DeviceTrust> {
        let device = self
            .active_for_user(user_id)
            .await?
            .ok_or_else(|| GateError::NotFound("No active device".to_string()))?;

        let result = sqlx::query(
            "UPDATE device_trust
             SET status = 'revoked', revoked_at = ?, revoked_by = ?, revoke_reason = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(reason.unwrap_or("self_revoked"))
        .bind(&device.id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::Conflict("Device is no longer active".to_string()));
        }

        metrics::record_device_transition("revoked");
        tracing::info!("User {} revoked device {}", user_id, device.id);
        self.get(&device.id)
            .await?
            .ok_or_else(|| GateError::Internal("Revoked device vanished".to_string()))
    }

    pub async fn get(&self, device_id: &str) -> GateResult<Option<DeviceTrust>> {
        let device = sqlx::query_as::<_, DeviceTrust>(&format!(
            "SELECT {} FROM device_trust WHERE id = ?",
            DEVICE_TRUST_COLUMNS
        ))
        .bind(device_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(device)
    }

    pub async fn active_for_user(&self, user_id: &str) -> GateResult<Option<DeviceTrust>> {
        let device = sqlx::query_as::<_, DeviceTrust>(&format!(
            "SELECT {} FROM device_trust WHERE user_id = ? AND status = 'active'",
            DEVICE_TRUST_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(device)
    }

    /// Every registration for a user, newest first
    pub async fn list_for_user(&self, user_id: &str) -> GateResult<Vec<DeviceTrust>> {
        let devices = sqlx::query_as::<_, DeviceTrust>(&format!(
            "SELECT {} FROM device_trust WHERE user_id = ? ORDER BY created_at DESC",
            DEVICE_TRUST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(devices)
    }

    /// Count a successful scan against the user's active device
    pub async fn record_scan(&self, user_id: &str) -> GateResult<()> {
        sqlx::query(
            "UPDATE device_trust SET scan_count = scan_count + 1, last_seen_at = ?
             WHERE user_id = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Expire active devices whose trust token has lapsed
    pub async fn expire_stale_tokens(&self) -> GateResult<u64> {
        let result = sqlx::query(
            "UPDATE device_trust SET status = 'expired'
             WHERE status = 'active' AND token_expires_at <= ?",
        )
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Expire registrations whose verification window closed
    pub async fn expire_pending_registrations(&self) -> GateResult<u64> {
        let result = sqlx::query(
            "UPDATE device_trust SET status = 'expired', verification_code_hash = NULL
             WHERE status = 'pending_sms_verification' AND verification_expires_at <= ?",
        )
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        self.resend_limiter.retain_recent();
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &SqlitePool {
        &self.db
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        db,
        sms::{MockSmsGateway, MockSmsStore, SmsGateway},
    };

    pub(crate) const PHONE: &str = "+919876543210";

    pub(crate) fn attrs(device_id: &str) -> DeviceAttributes {
        DeviceAttributes {
            device_id: device_id.to_string(),
            platform: "android".to_string(),
            model: Some("Pixel 7".to_string()),
            screen_width: Some(1080),
            screen_height: Some(2400),
            screen_density: Some(2.625),
            ..Default::default()
        }
    }

    pub(crate) async fn setup() -> (DeviceManager, Arc<MockSmsStore>) {
        let config = ServerConfig::for_testing();
        let pool = db::create_memory_pool().await.unwrap();
        let store = Arc::new(MockSmsStore::default());
        let gateway: Arc<dyn SmsGateway> = Arc::new(MockSmsGateway::new(
            Arc::clone(&store),
            config.sms.virtual_number.clone(),
        ));
        let tokens = Arc::new(TokenService::new(&config.authentication, 180, 300, 60));
        let manager = DeviceManager::new(pool, tokens, gateway, config.device, "tpl".to_string());
        (manager, store)
    }

    fn sms(from: &str, body: &str, id: &str) -> IncomingSms {
        IncomingSms {
            sender: from.to_string(),
            message: body.to_string(),
            received_at: Utc::now(),
            gateway_message_id: id.to_string(),
        }
    }

    /// Register and verify a device, returning (device_id, trust token)
    pub(crate) async fn activate_device(
        manager: &DeviceManager,
        store: &MockSmsStore,
        user_id: &str,
        device_id: &str,
        phone: &str,
    ) -> (String, String) {
        let challenge = manager
            .register(
                user_id,
                "college-42",
                "student",
                RegisterDevice {
                    phone: phone.to_string(),
                    device: attrs(device_id),
                },
            )
            .await
            .unwrap();
        let code = store.last_code_for(phone).unwrap();
        let outcome = manager
            .reconcile_incoming_sms(&sms(phone, &code, &format!("msg-{}", challenge.device_id)))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Activated { .. }));

        let view = manager.status(user_id, &challenge.device_id).await.unwrap();
        (challenge.device_id, view.device_trust_token.unwrap())
    }

    #[tokio::test]
    async fn test_registration_scenario() {
        let (manager, store) = setup().await;

        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: "9876543210".to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        assert_eq!(challenge.phone, PHONE);
        assert_eq!(challenge.status, DeviceStatus::PendingSmsVerification);
        assert_eq!(challenge.virtual_number, "+910000000000");

        let code = store.last_code_for(PHONE).unwrap();
        assert_eq!(code.len(), 6);

        // Still pending: no token yet
        let view = manager.status("user-1", &challenge.device_id).await.unwrap();
        assert_eq!(view.status, DeviceStatus::PendingSmsVerification);
        assert!(view.device_trust_token.is_none());

        let outcome = manager
            .reconcile_incoming_sms(&sms(PHONE, &code, "gw-1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Activated {
                device_id: challenge.device_id.clone()
            }
        );

        // A lost poll response can be retried until the device uses the token
        let first = manager.status("user-1", &challenge.device_id).await.unwrap();
        assert_eq!(first.status, DeviceStatus::Active);
        let token = first.device_trust_token.unwrap();
        let second = manager.status("user-1", &challenge.device_id).await.unwrap();
        assert_eq!(second.device_trust_token.as_deref(), Some(token.as_str()));

        let device = manager.verify_device_token(&token).await.unwrap();
        assert_eq!(device.user_id, "user-1");
        assert_eq!(device.verified_phone.as_deref(), Some(PHONE));
        assert!(device.verification_code_hash.is_none());

        let after_use = manager.status("user-1", &challenge.device_id).await.unwrap();
        assert!(after_use.device_trust_token.is_none());
        assert!(manager.status("user-2", &challenge.device_id).await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_is_idempotent() {
        let (manager, store) = setup().await;
        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        let code = store.last_code_for(PHONE).unwrap();

        let message = sms(PHONE, &format!("VERIFY {}", code), "gw-dup");
        assert!(matches!(
            manager.reconcile_incoming_sms(&message).await.unwrap(),
            WebhookOutcome::Activated { .. }
        ));
        assert_eq!(
            manager.reconcile_incoming_sms(&message).await.unwrap(),
            WebhookOutcome::Duplicate
        );

        let device = manager.get(&challenge.device_id).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_activation_can_be_redelivered() {
        let (manager, store) = setup().await;
        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        let code = store.last_code_for(PHONE).unwrap();

        sqlx::query(
            "CREATE TRIGGER fail_activation BEFORE UPDATE OF status ON device_trust
             BEGIN SELECT RAISE(ABORT, 'activation unavailable'); END",
        )
        .execute(manager.db())
        .await
        .unwrap();

        let message = sms(PHONE, &code, "gw-42");
        assert!(manager.reconcile_incoming_sms(&message).await.is_err());

        let (recorded,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sms_webhook_event WHERE gateway_message_id = 'gw-42'")
                .fetch_one(manager.db())
                .await
                .unwrap();
        assert_eq!(recorded, 0);
        let device = manager.get(&challenge.device_id).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::PendingSmsVerification);

        sqlx::query("DROP TRIGGER fail_activation")
            .execute(manager.db())
            .await
            .unwrap();

        assert_eq!(
            manager.reconcile_incoming_sms(&message).await.unwrap(),
            WebhookOutcome::Activated {
                device_id: challenge.device_id.clone()
            }
        );
        assert_eq!(
            manager.reconcile_incoming_sms(&message).await.unwrap(),
            WebhookOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_code_from_other_phone_does_not_match() {
        let (manager, store) = setup().await;
        manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        let code = store.last_code_for(PHONE).unwrap();

        let outcome = manager
            .reconcile_incoming_sms(&sms("+919999999999", &code, "gw-2"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_resend_invalidates_previous_code() {
        let (manager, store) = setup().await;
        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        // Pin the first code so the comparison below never depends on chance
        const OLD_CODE: &str = "481516";
        sqlx::query("UPDATE device_trust SET verification_code_hash = ? WHERE id = ?")
            .bind(codes::hash_secret(OLD_CODE))
            .bind(&challenge.device_id)
            .execute(manager.db())
            .await
            .unwrap();

        let resent = manager.resend("user-1", &challenge.device_id).await.unwrap();
        assert_eq!(resent.resends_remaining, 4);
        let mut new_code = store.last_code_for(PHONE).unwrap();
        // A fresh draw may repeat the pinned digits; draw again until it differs
        while new_code == OLD_CODE {
            manager.resend("user-1", &challenge.device_id).await.unwrap();
            new_code = store.last_code_for(PHONE).unwrap();
        }
        assert_ne!(new_code, OLD_CODE);

        let outcome = manager
            .reconcile_incoming_sms(&sms(PHONE, OLD_CODE, "gw-old"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Unmatched);

        let outcome = manager
            .reconcile_incoming_sms(&sms(PHONE, &new_code, "gw-new"))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Activated { .. }));
    }

    #[tokio::test]
    async fn test_resend_is_rate_limited() {
        let (manager, _store) = setup().await;
        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();

        for _ in 0..3 {
            manager.resend("user-1", &challenge.device_id).await.unwrap();
        }
        assert!(matches!(
            manager.resend("user-1", &challenge.device_id).await,
            Err(GateError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_code_does_not_activate() {
        let (manager, store) = setup().await;
        let challenge = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("pixel-7-0001"),
                },
            )
            .await
            .unwrap();
        let code = store.last_code_for(PHONE).unwrap();

        sqlx::query("UPDATE device_trust SET verification_expires_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(1))
            .bind(&challenge.device_id)
            .execute(manager.db())
            .await
            .unwrap();

        let outcome = manager
            .reconcile_incoming_sms(&sms(PHONE, &code, "gw-late"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Unmatched);

        assert_eq!(manager.expire_pending_registrations().await.unwrap(), 1);
        let device = manager.get(&challenge.device_id).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Expired);
    }

    #[tokio::test]
    async fn test_second_registration_requires_transfer() {
        let (manager, store) = setup().await;
        activate_device(&manager, &store, "user-1", "pixel-7-0001", PHONE).await;

        let result = manager
            .register(
                "user-1",
                "college-42",
                "student",
                RegisterDevice {
                    phone: PHONE.to_string(),
                    device: attrs("galaxy-s23-0002"),
                },
            )
            .await;
        assert!(matches!(result, Err(GateError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_revoked_device_token_rejected() {
        let (manager, store) = setup().await;
        let (_, token) = activate_device(&manager, &store, "user-1", "pixel-7-0001", PHONE).await;

        manager.revoke_own("user-1", None).await.unwrap();
        assert!(matches!(
            manager.verify_device_token(&token).await,
            Err(GateError::DeviceTrustInvalid)
        ));
        assert!(manager.active_for_user("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_scan_increments_counter() {
        let (manager, store) = setup().await;
        let (device_id, _) = activate_device(&manager, &store, "user-1", "pixel-7-0001", PHONE).await;

        manager.record_scan("user-1").await.unwrap();
        manager.record_scan("user-1").await.unwrap();
        let device = manager.get(&device_id).await.unwrap().unwrap();
        assert_eq!(device.scan_count, 2);
        assert!(device.last_seen_at.is_some());
    }
}
