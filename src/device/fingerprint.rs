/// Deterministic device identity hashing
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use validator::Validate;

/// Number of hex characters of the fingerprint embedded in tokens
pub const PREFIX_LEN: usize = 16;

/// Attributes reported by the client about its hardware
///
/// Only attributes that persist for the life of the physical device take part
/// in the hash. `app_version`, `os_version` and `carrier` are accepted for
/// diagnostics and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DeviceAttributes {
    #[validate(length(min = 4, max = 256))]
    pub device_id: String,
    #[validate(length(min = 1, max = 32))]
    pub platform: String,
    #[validate(length(max = 128))]
    pub model: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub screen_density: Option<f32>,
    pub app_version: Option<String>,
    pub os_version: Option<String>,
    pub carrier: Option<String>,
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Compute the 64 hex character fingerprint of a device
pub fn fingerprint(attrs: &DeviceAttributes) -> String {
    let density = attrs
        .screen_density
        .map(|d| format!("{:.2}", d))
        .unwrap_or_default();

    let canonical = [
        ("device_id", normalize(&attrs.device_id)),
        ("platform", normalize(&attrs.platform)),
        ("model", attrs.model.as_deref().map(normalize).unwrap_or_default()),
        (
            "screen_width",
            attrs.screen_width.map(|w| w.to_string()).unwrap_or_default(),
        ),
        (
            "screen_height",
            attrs.screen_height.map(|h| h.to_string()).unwrap_or_default(),
        ),
        ("screen_density", density),
    ]
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("|");

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Truncated fingerprint carried in token claims
pub fn prefix(fingerprint: &str) -> &str {
    fingerprint.get(..PREFIX_LEN).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel() -> DeviceAttributes {
        DeviceAttributes {
            device_id: "a1b2c3d4e5f60718".to_string(),
            platform: "android".to_string(),
            model: Some("Pixel 7".to_string()),
            screen_width: Some(1080),
            screen_height: Some(2400),
            screen_density: Some(2.625),
            app_version: Some("3.2.0".to_string()),
            os_version: Some("14".to_string()),
            carrier: Some("Jio".to_string()),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fp = fingerprint(&pixel());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&pixel()));
    }

    #[test]
    fn test_app_and_os_updates_do_not_change_fingerprint() {
        let before = fingerprint(&pixel());

        let mut updated = pixel();
        updated.app_version = Some("4.0.0".to_string());
        updated.os_version = Some("15".to_string());
        updated.carrier = Some("Airtel".to_string());

        assert_eq!(before, fingerprint(&updated));
    }

    #[test]
    fn test_hardware_change_changes_fingerprint() {
        let mut other = pixel();
        other.device_id = "ffffeeeeddddcccc".to_string();
        assert_ne!(fingerprint(&pixel()), fingerprint(&other));

        let mut other_model = pixel();
        other_model.model = Some("Pixel 8".to_string());
        assert_ne!(fingerprint(&pixel()), fingerprint(&other_model));
    }

    #[test]
    fn test_prefix() {
        let fp = fingerprint(&pixel());
        assert_eq!(prefix(&fp).len(), PREFIX_LEN);
        assert!(fp.starts_with(prefix(&fp)));
        assert_eq!(prefix("abc"), "abc");
    }

    #[test]
    fn test_attribute_validation() {
        let mut attrs = pixel();
        assert!(attrs.validate().is_ok());
        attrs.device_id = "x".to_string();
        assert!(attrs.validate().is_err());
    }
}
