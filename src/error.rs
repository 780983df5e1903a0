/// Unified error types for Campus Gate
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum GateError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No valid session/identity on the request
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed (e.g. non-admin on admin endpoints)
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// No device-trust token presented
    #[error("Device not registered")]
    DeviceNotRegistered,

    /// Bad signature, expired, fingerprint mismatch, or record not active
    #[error("Device trust invalid")]
    DeviceTrustInvalid,

    /// QR identity/location token missing, malformed, or not bound to this device
    #[error("QR token invalid")]
    QrTokenInvalid,

    /// QR identity token past its expiry
    #[error("QR token expired")]
    QrTokenExpired,

    /// Location QR signature does not match the current rotation key
    #[error("Location signature mismatch")]
    LocationSignatureMismatch,

    /// GPS coordinates required but absent or malformed
    #[error("Location required")]
    GeofenceRequired,

    /// GPS coordinates outside the configured radius
    #[error("Outside permitted area")]
    GeofenceViolation,

    /// Biometric confirmation signal missing
    #[error("Biometric confirmation required")]
    BiometricRequired,

    /// Successful scan already recorded within the duplicate window
    #[error("Duplicate scan rejected")]
    DuplicateScanRejected,

    /// Scan refused by action point configuration (inactive, out of hours, wrong mode)
    #[error("Scan rejected: {0}")]
    ScanRejected(String),

    /// Transfer code unknown, already used, expired, or presented from the same device
    #[error("Transfer code invalid or expired")]
    TransferCodeInvalidOrExpired,

    /// Too many attempts
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: std::time::Duration },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g. a second active device)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// SMS provider failures
    #[error("SMS gateway error: {0}")]
    SmsGateway(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Stable machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            GateError::Unauthenticated(_) => "Unauthenticated",
            GateError::Authorization(_) => "Forbidden",
            GateError::DeviceNotRegistered => "DeviceNotRegistered",
            GateError::DeviceTrustInvalid => "DeviceTrustInvalid",
            // Expiry is not distinguished from other token failures on the wire
            GateError::QrTokenInvalid | GateError::QrTokenExpired => "QrTokenInvalid",
            GateError::LocationSignatureMismatch => "LocationSignatureMismatch",
            GateError::GeofenceRequired => "GeofenceRequired",
            GateError::GeofenceViolation => "GeofenceViolation",
            GateError::BiometricRequired => "BiometricRequired",
            GateError::DuplicateScanRejected => "DuplicateScanRejected",
            GateError::ScanRejected(_) => "ScanRejected",
            GateError::TransferCodeInvalidOrExpired => "TransferCodeInvalidOrExpired",
            GateError::RateLimited { .. } => "RateLimited",
            GateError::Validation(_) => "InvalidRequest",
            GateError::NotFound(_) => "NotFound",
            GateError::Conflict(_) => "Conflict",
            GateError::SmsGateway(_) => "SmsUnavailable",
            GateError::Database(_) | GateError::Internal(_) | GateError::Io(_) => {
                "InternalServerError"
            }
        }
    }

    /// Reason recorded in the scan log for rejected scans
    pub fn rejection_reason(&self) -> String {
        match self {
            GateError::QrTokenExpired => "qr_token_expired".to_string(),
            GateError::QrTokenInvalid => "qr_token_invalid".to_string(),
            GateError::DeviceTrustInvalid => "device_trust_invalid".to_string(),
            GateError::DeviceNotRegistered => "device_not_registered".to_string(),
            GateError::LocationSignatureMismatch => "location_signature_mismatch".to_string(),
            GateError::GeofenceRequired => "geofence_required".to_string(),
            GateError::GeofenceViolation => "geofence_violation".to_string(),
            GateError::BiometricRequired => "biometric_required".to_string(),
            GateError::Unauthenticated(_) => "unauthenticated".to_string(),
            GateError::ScanRejected(reason) => reason.clone(),
            other => other.code().to_lowercase(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GateError::Unauthenticated(_)
            | GateError::DeviceTrustInvalid
            | GateError::QrTokenInvalid
            | GateError::QrTokenExpired => StatusCode::UNAUTHORIZED,
            GateError::Authorization(_)
            | GateError::DeviceNotRegistered
            | GateError::LocationSignatureMismatch
            | GateError::GeofenceRequired
            | GateError::GeofenceViolation
            | GateError::BiometricRequired
            | GateError::ScanRejected(_) => StatusCode::FORBIDDEN,
            GateError::DuplicateScanRejected | GateError::Conflict(_) => StatusCode::CONFLICT,
            GateError::TransferCodeInvalidOrExpired | GateError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::SmsGateway(_) => StatusCode::BAD_GATEWAY,
            GateError::Database(_) | GateError::Internal(_) | GateError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn remediation(&self) -> String {
        match self {
            GateError::Unauthenticated(_) => "Sign in to continue".to_string(),
            GateError::DeviceNotRegistered => "Register this device to continue".to_string(),
            GateError::DeviceTrustInvalid => {
                "This device is no longer trusted, register it again".to_string()
            }
            GateError::QrTokenInvalid | GateError::QrTokenExpired => {
                "QR code is invalid or expired, refresh and try again".to_string()
            }
            GateError::LocationSignatureMismatch => {
                "This QR code is no longer valid, scan the current code".to_string()
            }
            GateError::GeofenceRequired => "Enable location services to continue".to_string(),
            GateError::GeofenceViolation => "You are outside the permitted area".to_string(),
            GateError::BiometricRequired => "Confirm your identity with biometrics".to_string(),
            GateError::DuplicateScanRejected => "This scan was already recorded".to_string(),
            GateError::TransferCodeInvalidOrExpired => {
                "Transfer code is invalid or expired".to_string()
            }
            GateError::RateLimited { .. } => "Too many attempts, try again later".to_string(),
            GateError::SmsGateway(_) => "SMS service unavailable, try again later".to_string(),
            // Don't leak details
            GateError::Database(_) | GateError::Internal(_) | GateError::Io(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert GateError to HTTP response
impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match &self {
            GateError::Database(e) => tracing::error!("Database error: {}", e),
            GateError::Internal(e) => tracing::error!("Internal error: {}", e),
            GateError::Io(e) => tracing::error!("IO error: {}", e),
            GateError::SmsGateway(e) => tracing::error!("SMS gateway error: {}", e),
            _ => {}
        }

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message: self.remediation(),
        });

        let mut response = (self.status(), body).into_response();
        if let GateError::RateLimited { retry_after } = self {
            if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Result type alias for service operations
pub type GateResult<T> = Result<T, GateError>;
