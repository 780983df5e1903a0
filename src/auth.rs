/// Session authentication and admin extractors
///
/// Sessions are HS256 JWTs minted by the institution's platform auth service;
/// this service only verifies them.
use crate::{
    api::middleware::extract_bearer_token,
    context::AppContext,
    error::{GateError, GateResult},
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

/// Claims carried by a platform session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub tenant: String,
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: i64,
}

/// Who the caller is, as asserted by a verified session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub tenant_id: String,
    pub user_type: String,
    pub role: Option<String>,
}

impl From<SessionClaims> for SessionIdentity {
    fn from(claims: SessionClaims) -> Self {
        Self {
            user_id: claims.sub,
            tenant_id: claims.tenant,
            user_type: claims.user_type,
            role: claims.role,
        }
    }
}

/// Verify a session JWT: signature, expiry and required claims
pub fn verify_session_token(token: &str, session_secret: &str) -> GateResult<SessionIdentity> {
    let decoding_key = DecodingKey::from_secret(session_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let claims = decode::<SessionClaims>(token, &decoding_key, &validation)
        .map_err(|e| {
            tracing::warn!("Session verification failed: {}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GateError::Unauthenticated("Session has expired".to_string())
                }
                _ => GateError::Unauthenticated("Invalid session".to_string()),
            }
        })?
        .claims;

    if claims.sub.is_empty() || claims.tenant.is_empty() {
        return Err(GateError::Unauthenticated("Session is missing identity".to_string()));
    }

    Ok(claims.into())
}

/// Sign a session token (platform auth service, local tooling, tests)
pub fn issue_session_token(claims: &SessionClaims, session_secret: &str) -> GateResult<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(session_secret.as_bytes()),
    )
    .map_err(|e| GateError::Internal(format!("Failed to sign session: {}", e)))
}

/// Admin context - requires the admin role or a configured admin id
#[derive(Debug, Clone)]
pub struct AdminAuthContext {
    pub identity: SessionIdentity,
}

impl AdminAuthContext {
    pub fn admin_id(&self) -> &str {
        &self.identity.user_id
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = GateError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| GateError::Unauthenticated("Missing authorization header".to_string()))?;

        let identity = verify_session_token(&token, &state.config.authentication.session_secret)?;

        let is_configured_admin = state.is_admin(&identity.user_id);
        let has_admin_role = identity.role.as_deref() == Some(ADMIN_ROLE);

        if !is_configured_admin && !has_admin_role {
            tracing::warn!("AdminAuthContext: User {} is not an admin", identity.user_id);
            return Err(GateError::Authorization("Admin role required".to_string()));
        }

        tracing::debug!("AdminAuthContext: admin {} authenticated", identity.user_id);
        Ok(AdminAuthContext { identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    const SECRET: &str = "test-session-secret-for-testing-only!";

    fn claims(exp_offset: Duration) -> SessionClaims {
        SessionClaims {
            sub: "user-1".to_string(),
            tenant: "college-42".to_string(),
            user_type: "student".to_string(),
            role: None,
            exp: (Utc::now() + exp_offset).timestamp(),
        }
    }

    #[test]
    fn test_session_round_trip() {
        let token = issue_session_token(&claims(Duration::hours(1)), SECRET).unwrap();
        let identity = verify_session_token(&token, SECRET).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.tenant_id, "college-42");
        assert_eq!(identity.role, None);
    }

    #[test]
    fn test_expired_session_rejected() {
        let token = issue_session_token(&claims(Duration::hours(-1)), SECRET).unwrap();
        assert!(matches!(
            verify_session_token(&token, SECRET),
            Err(GateError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_session_token(&claims(Duration::hours(1)), SECRET).unwrap();
        assert!(verify_session_token(&token, "another-secret-entirely-different!!").is_err());
    }
}
