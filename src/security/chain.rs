/// Ordered guard evaluation
use super::{RequestCredentials, SecurityContext, SecurityLevel};
use crate::{
    auth::verify_session_token,
    crypto::{TokenError, TokenService},
    device::DeviceManager,
    error::{GateError, GateResult},
    metrics,
    scan::geo::GpsPoint,
};
use std::sync::Arc;

pub struct SecurityChain {
    session_secret: String,
    tokens: Arc<TokenService>,
    devices: Arc<DeviceManager>,
}

impl SecurityChain {
    pub fn new(session_secret: String, tokens: Arc<TokenService>, devices: Arc<DeviceManager>) -> Self {
        Self {
            session_secret,
            tokens,
            devices,
        }
    }

    /// Run every guard from level 1 up to `required`
    pub async fn enforce(
        &self,
        required: SecurityLevel,
        creds: &RequestCredentials,
    ) -> GateResult<SecurityContext> {
        self.advance(SecurityContext::public(), required, creds).await
    }

    /// Continue from what `ctx` has already cleared up to `required`
    pub async fn advance(
        &self,
        mut ctx: SecurityContext,
        required: SecurityLevel,
        creds: &RequestCredentials,
    ) -> GateResult<SecurityContext> {
        while ctx.cleared < required {
            let Some(level) = ctx.cleared.next() else {
                break;
            };
            ctx = self.check(level, ctx, creds).await.inspect_err(|e| {
                metrics::record_chain_failure(level.as_str());
                tracing::debug!("Security chain stopped at {}: {}", level.as_str(), e);
            })?;
            ctx.cleared = level;
        }
        Ok(ctx)
    }

    async fn check(
        &self,
        level: SecurityLevel,
        ctx: SecurityContext,
        creds: &RequestCredentials,
    ) -> GateResult<SecurityContext> {
        match level {
            SecurityLevel::Public => Ok(ctx),
            SecurityLevel::Authenticated => self.check_session(ctx, creds),
            SecurityLevel::DeviceVerified => self.check_device(ctx, creds).await,
            SecurityLevel::QrSecured => self.check_qr(ctx, creds),
            SecurityLevel::Elevated => check_gps(ctx, creds),
            SecurityLevel::Strict => check_biometric(ctx, creds),
        }
    }

    fn check_session(
        &self,
        mut ctx: SecurityContext,
        creds: &RequestCredentials,
    ) -> GateResult<SecurityContext> {
        let token = creds
            .session_token
            .as_deref()
            .ok_or_else(|| GateError::Unauthenticated("Missing authorization header".to_string()))?;
        ctx.identity = Some(verify_session_token(token, &self.session_secret)?);
        Ok(ctx)
    }

    async fn check_device(
        &self,
        mut ctx: SecurityContext,
        creds: &RequestCredentials,
    ) -> GateResult<SecurityContext> {
        let token = creds
            .device_trust_token
            .as_deref()
            .ok_or(GateError::DeviceNotRegistered)?;
        let device = self.devices.verify_device_token(token).await?;

        if ctx.user_id() != Some(device.user_id.as_str()) {
            tracing::warn!("Device {} presented by a different user", device.id);
            return Err(GateError::DeviceTrustInvalid);
        }

        ctx.device = Some(device);
        Ok(ctx)
    }

    fn check_qr(&self, mut ctx: SecurityContext, creds: &RequestCredentials) -> GateResult<SecurityContext> {
        let token = creds.qr_token.as_deref().ok_or(GateError::QrTokenInvalid)?;
        let claims = self.tokens.validate_identity_token(token).map_err(|e| match e {
            TokenError::Expired => GateError::QrTokenExpired,
            TokenError::Invalid => GateError::QrTokenInvalid,
        })?;

        let (Some(identity), Some(device)) = (&ctx.identity, &ctx.device) else {
            return Err(GateError::QrTokenInvalid);
        };
        let bound = claims.sub == identity.user_id
            && claims.dfp == device.fingerprint_prefix()
            && TokenService::identity_matches_tenant(&claims, &identity.tenant_id);
        if !bound {
            tracing::warn!("Identity QR not bound to the presenting device");
            return Err(GateError::QrTokenInvalid);
        }

        ctx.qr = Some(claims);
        Ok(ctx)
    }
}

fn check_gps(mut ctx: SecurityContext, creds: &RequestCredentials) -> GateResult<SecurityContext> {
    let point = GpsPoint::parse_pair(creds.gps_latitude.as_deref(), creds.gps_longitude.as_deref())
        .map_err(|_| GateError::GeofenceRequired)?
        .ok_or(GateError::GeofenceRequired)?;
    ctx.gps = Some(point);
    Ok(ctx)
}

fn check_biometric(mut ctx: SecurityContext, creds: &RequestCredentials) -> GateResult<SecurityContext> {
    let confirmed = matches!(
        creds.biometric.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("true") | Some("1")
    );
    if !confirmed {
        return Err(GateError::BiometricRequired);
    }
    ctx.biometric_confirmed = true;
    Ok(ctx)
}
