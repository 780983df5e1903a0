/// Progressive security levels
///
/// Every route declares the minimum level it needs. Enforcement walks the
/// levels upward from what is already cleared and stops at the first guard
/// that fails; a higher guard never runs before every lower one has passed.

pub mod chain;
pub mod extract;

pub use chain::SecurityChain;
pub use extract::{Authenticated, DeviceVerified, Elevated, QrSecured, RequiredLevel, Secured, Strict};

use crate::{
    api::middleware::{
        extract_bearer_token, BIOMETRIC_HEADER, DEVICE_TRUST_HEADER, GPS_LATITUDE_HEADER,
        GPS_LONGITUDE_HEADER, QR_TOKEN_HEADER,
    },
    auth::SessionIdentity,
    crypto::IdentityQrClaims,
    db::device::DeviceTrust,
    scan::geo::GpsPoint,
};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Public = 0,
    Authenticated = 1,
    DeviceVerified = 2,
    QrSecured = 3,
    Elevated = 4,
    Strict = 5,
}

impl SecurityLevel {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SecurityLevel::Public),
            1 => Some(SecurityLevel::Authenticated),
            2 => Some(SecurityLevel::DeviceVerified),
            3 => Some(SecurityLevel::QrSecured),
            4 => Some(SecurityLevel::Elevated),
            5 => Some(SecurityLevel::Strict),
            _ => None,
        }
    }

    /// The level directly above, if any
    pub fn next(self) -> Option<Self> {
        Self::from_i64(self as i64 + 1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Public => "public",
            SecurityLevel::Authenticated => "authenticated",
            SecurityLevel::DeviceVerified => "device_verified",
            SecurityLevel::QrSecured => "qr_secured",
            SecurityLevel::Elevated => "elevated",
            SecurityLevel::Strict => "strict",
        }
    }
}

/// Raw credential material carried by a request
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    pub session_token: Option<String>,
    pub device_trust_token: Option<String>,
    pub qr_token: Option<String>,
    pub gps_latitude: Option<String>,
    pub gps_longitude: Option<String>,
    pub biometric: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RequestCredentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            session_token: extract_bearer_token(headers),
            device_trust_token: header(headers, DEVICE_TRUST_HEADER),
            qr_token: header(headers, QR_TOKEN_HEADER),
            gps_latitude: header(headers, GPS_LATITUDE_HEADER),
            gps_longitude: header(headers, GPS_LONGITUDE_HEADER),
            biometric: header(headers, BIOMETRIC_HEADER),
        }
    }
}

/// What the chain has established about a request so far
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub cleared: SecurityLevel,
    pub identity: Option<SessionIdentity>,
    pub device: Option<DeviceTrust>,
    pub qr: Option<IdentityQrClaims>,
    pub gps: Option<GpsPoint>,
    pub biometric_confirmed: bool,
}

impl SecurityContext {
    pub fn public() -> Self {
        Self {
            cleared: SecurityLevel::Public,
            identity: None,
            device: None,
            qr: None,
            gps: None,
            biometric_confirmed: false,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.tenant_id.as_str())
    }
}
