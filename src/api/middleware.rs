/// Request header helpers
use axum::http::HeaderMap;

pub const DEVICE_TRUST_HEADER: &str = "x-device-trust-token";
pub const QR_TOKEN_HEADER: &str = "x-qr-token";
pub const GPS_LATITUDE_HEADER: &str = "x-gps-latitude";
pub const GPS_LONGITUDE_HEADER: &str = "x-gps-longitude";
pub const BIOMETRIC_HEADER: &str = "x-biometric-verified";
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
