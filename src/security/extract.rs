/// Route-level security declarations
use super::{RequestCredentials, SecurityContext, SecurityLevel};
use crate::{context::AppContext, error::GateError};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::marker::PhantomData;

/// Minimum level a route requires
pub trait RequiredLevel: Send + Sync + 'static {
    const LEVEL: SecurityLevel;
}

macro_rules! required_level {
    ($name:ident, $level:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl RequiredLevel for $name {
            const LEVEL: SecurityLevel = $level;
        }
    };
}

required_level!(Authenticated, SecurityLevel::Authenticated);
required_level!(DeviceVerified, SecurityLevel::DeviceVerified);
required_level!(QrSecured, SecurityLevel::QrSecured);
required_level!(Elevated, SecurityLevel::Elevated);
required_level!(Strict, SecurityLevel::Strict);

/// A request that cleared the chain up to `L`
#[derive(Debug, Clone)]
pub struct Secured<L: RequiredLevel> {
    pub context: SecurityContext,
    pub credentials: RequestCredentials,
    _level: PhantomData<L>,
}

#[async_trait]
impl<L: RequiredLevel> FromRequestParts<AppContext> for Secured<L> {
    type Rejection = GateError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let credentials = RequestCredentials::from_headers(&parts.headers);
        let context = state.security_chain.enforce(L::LEVEL, &credentials).await?;

        Ok(Secured {
            context,
            credentials,
            _level: PhantomData,
        })
    }
}

impl<L: RequiredLevel> Secured<L> {
    /// Session identity; always present at level 1 and above
    pub fn identity(&self) -> Result<&crate::auth::SessionIdentity, GateError> {
        self.context
            .identity
            .as_ref()
            .ok_or_else(|| GateError::Unauthenticated("No session".to_string()))
    }

    /// Verified device; present at level 2 and above
    pub fn device(&self) -> Result<&crate::db::device::DeviceTrust, GateError> {
        self.context.device.as_ref().ok_or(GateError::DeviceNotRegistered)
    }
}
