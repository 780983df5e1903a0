/// HMAC signatures for location (Mode B) QR codes
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters kept from the full HMAC for compact QR payloads
pub const SIGNATURE_LEN: usize = 32;

/// Signs action point QR payloads with the platform-wide secret
pub struct ActionPointSigner {
    secret: Vec<u8>,
}

impl ActionPointSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Truncated HMAC-SHA256 over `id:action_type:location_code:tenant_id:rotation_key`
    pub fn sign(
        &self,
        action_point_id: &str,
        action_type: &str,
        location_code: &str,
        tenant_id: &str,
        rotation_key: &str,
    ) -> String {
        let message = format!(
            "{}:{}:{}:{}:{}",
            action_point_id, action_type, location_code, tenant_id, rotation_key
        );

        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(message.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        digest[..SIGNATURE_LEN].to_string()
    }

    /// Recompute and compare in constant time
    pub fn verify(
        &self,
        presented: &str,
        action_point_id: &str,
        action_type: &str,
        location_code: &str,
        tenant_id: &str,
        rotation_key: &str,
    ) -> bool {
        let expected = self.sign(action_point_id, action_type, location_code, tenant_id, rotation_key);
        if expected.is_empty() || presented.len() != expected.len() {
            return false;
        }
        presented.to_lowercase().as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> ActionPointSigner {
        ActionPointSigner::new("test-action-point-secret-for-testing!")
    }

    #[test]
    fn test_signature_shape() {
        let sig = signer().sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_accepts_current_key() {
        let s = signer();
        let sig = s.sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        assert!(s.verify(&sig, "ap-1", "mess_entry", "MESS-A", "college-1", "key-1"));
    }

    #[test]
    fn test_rotated_key_invalidates_signature() {
        let s = signer();
        let sig = s.sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        assert!(!s.verify(&sig, "ap-1", "mess_entry", "MESS-A", "college-1", "key-2"));
    }

    #[test]
    fn test_any_field_change_invalidates_signature() {
        let s = signer();
        let sig = s.sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        assert!(!s.verify(&sig, "ap-2", "mess_entry", "MESS-A", "college-1", "key-1"));
        assert!(!s.verify(&sig, "ap-1", "hostel_entry", "MESS-A", "college-1", "key-1"));
        assert!(!s.verify(&sig, "ap-1", "mess_entry", "MESS-B", "college-1", "key-1"));
        assert!(!s.verify(&sig, "ap-1", "mess_entry", "MESS-A", "college-2", "key-1"));
        assert!(!s.verify("deadbeef", "ap-1", "mess_entry", "MESS-A", "college-1", "key-1"));
    }

    #[test]
    fn test_different_secret_different_signature() {
        let other = ActionPointSigner::new("another-action-point-secret-value!!");
        let a = signer().sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        let b = other.sign("ap-1", "mess_entry", "MESS-A", "college-1", "key-1");
        assert_ne!(a, b);
    }
}
