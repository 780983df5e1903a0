/// Device Trust Tokens and QR Identity Tokens
///
/// Both families are compact HS256 JWTs with their own secrets and a fixed
/// `typ` tag, so a token of one family can never be accepted as the other.
/// Validation collapses every failure into [`TokenError`]; the precise reason
/// is logged here and never returned to callers.
use crate::{config::AuthConfig, device::fingerprint};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const DEVICE_TRUST_TYPE: &str = "device_trust";
pub const IDENTITY_QR_TYPE: &str = "identity_qr";

/// Characters of the tenant id embedded in identity tokens
pub const TENANT_PREFIX_LEN: usize = 8;
/// Characters of the user category embedded in identity tokens
pub const USER_TYPE_PREFIX_LEN: usize = 3;

/// Claims of the long-lived device credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTrustClaims {
    pub sub: String,
    pub did: String,
    pub dfp: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of the short-lived rotating identity QR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityQrClaims {
    pub sub: String,
    pub typ: String,
    pub dfp: String,
    pub col: String,
    pub utp: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly minted identity token and its refresh schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_after_seconds: i64,
}

/// Why a token was refused
///
/// Expired is kept apart so scan logs can record it; callers must still
/// present both as a single invalid-token error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Invalid,
    Expired,
}

fn truncate(value: &str, len: usize) -> String {
    value.chars().take(len).collect()
}

/// Issues and validates both token families
pub struct TokenService {
    device_encoding: EncodingKey,
    device_decoding: DecodingKey,
    qr_encoding: EncodingKey,
    qr_decoding: DecodingKey,
    device_ttl: Duration,
    qr_ttl: Duration,
    qr_refresh_seconds: i64,
}

impl TokenService {
    pub fn new(
        auth: &AuthConfig,
        device_ttl_days: i64,
        qr_ttl_seconds: i64,
        qr_refresh_seconds: i64,
    ) -> Self {
        Self {
            device_encoding: EncodingKey::from_secret(auth.device_trust_secret.as_bytes()),
            device_decoding: DecodingKey::from_secret(auth.device_trust_secret.as_bytes()),
            qr_encoding: EncodingKey::from_secret(auth.qr_identity_secret.as_bytes()),
            qr_decoding: DecodingKey::from_secret(auth.qr_identity_secret.as_bytes()),
            device_ttl: Duration::days(device_ttl_days),
            qr_ttl: Duration::seconds(qr_ttl_seconds),
            qr_refresh_seconds,
        }
    }

    /// Lifetime of a new Device Trust Token
    pub fn device_ttl(&self) -> Duration {
        self.device_ttl
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }

    /// Sign a Device Trust Token with explicit timestamps
    ///
    /// Signing is deterministic, so the same record always yields the same token.
    pub fn issue_device_token(
        &self,
        user_id: &str,
        device_id: &str,
        device_fingerprint: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<String> {
        let claims = DeviceTrustClaims {
            sub: user_id.to_string(),
            did: device_id.to_string(),
            dfp: fingerprint::prefix(device_fingerprint).to_string(),
            typ: DEVICE_TRUST_TYPE.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.device_encoding)
            .map_err(|e| tracing::error!("Failed to sign device trust token: {}", e))
            .ok()
    }

    /// Validate signature, expiry, required claims and type tag
    pub fn validate_device_token(&self, token: &str) -> Result<DeviceTrustClaims, TokenError> {
        let claims = decode::<DeviceTrustClaims>(token, &self.device_decoding, &Self::validation())
            .map_err(|e| Self::classify("device trust", e))?
            .claims;

        if claims.typ != DEVICE_TRUST_TYPE {
            tracing::warn!("Device trust token rejected: wrong type tag {}", claims.typ);
            return Err(TokenError::Invalid);
        }
        if claims.exp <= Utc::now().timestamp() {
            tracing::warn!("Device trust token rejected: expired");
            return Err(TokenError::Expired);
        }
        if claims.did.is_empty() || claims.dfp.len() != fingerprint::PREFIX_LEN {
            tracing::warn!("Device trust token rejected: malformed claims");
            return Err(TokenError::Invalid);
        }

        Ok(claims)
    }

    /// Mint an identity QR token valid for the configured lifetime
    pub fn issue_identity_token(
        &self,
        user_id: &str,
        device_fingerprint: &str,
        tenant_id: &str,
        user_type: &str,
    ) -> Option<IdentityToken> {
        let now = Utc::now();
        self.issue_identity_token_at(user_id, device_fingerprint, tenant_id, user_type, now, now + self.qr_ttl)
    }

    pub fn issue_identity_token_at(
        &self,
        user_id: &str,
        device_fingerprint: &str,
        tenant_id: &str,
        user_type: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<IdentityToken> {
        let claims = IdentityQrClaims {
            sub: user_id.to_string(),
            typ: IDENTITY_QR_TYPE.to_string(),
            dfp: fingerprint::prefix(device_fingerprint).to_string(),
            col: truncate(tenant_id, TENANT_PREFIX_LEN),
            utp: truncate(user_type, USER_TYPE_PREFIX_LEN),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.qr_encoding)
            .map_err(|e| tracing::error!("Failed to sign identity QR token: {}", e))
            .ok()?;

        Some(IdentityToken {
            token,
            expires_at,
            refresh_after_seconds: self.qr_refresh_seconds,
        })
    }

    /// Validate an identity QR token
    pub fn validate_identity_token(&self, token: &str) -> Result<IdentityQrClaims, TokenError> {
        let claims = decode::<IdentityQrClaims>(token, &self.qr_decoding, &Self::validation())
            .map_err(|e| Self::classify("identity QR", e))?
            .claims;

        if claims.typ != IDENTITY_QR_TYPE {
            tracing::warn!("Identity QR token rejected: wrong type tag {}", claims.typ);
            return Err(TokenError::Invalid);
        }
        if claims.exp <= Utc::now().timestamp() {
            tracing::warn!("Identity QR token rejected: expired");
            return Err(TokenError::Expired);
        }
        if claims.dfp.len() != fingerprint::PREFIX_LEN {
            tracing::warn!("Identity QR token rejected: malformed fingerprint prefix");
            return Err(TokenError::Invalid);
        }

        Ok(claims)
    }

    /// Whether identity claims were minted for the given tenant
    pub fn identity_matches_tenant(claims: &IdentityQrClaims, tenant_id: &str) -> bool {
        claims.col == truncate(tenant_id, TENANT_PREFIX_LEN)
    }

    fn classify(family: &str, e: jsonwebtoken::errors::Error) -> TokenError {
        match e.kind() {
            ErrorKind::ExpiredSignature => {
                tracing::warn!("{} token rejected: expired", family);
                TokenError::Expired
            }
            ErrorKind::InvalidSignature => {
                tracing::warn!("{} token rejected: signature mismatch", family);
                TokenError::Invalid
            }
            _ => {
                tracing::warn!("{} token rejected: {}", family, e);
                TokenError::Invalid
            }
        }
    }
}
