/// Numeric one-time codes and their stored digests
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Digits in an SMS verification code
pub const VERIFICATION_CODE_DIGITS: usize = 6;

/// Digits in a device transfer code
pub const TRANSFER_CODE_DIGITS: usize = 8;

/// Generate a random numeric code of `digits` length (leading zeros allowed)
pub fn generate_numeric_code(digits: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..digits)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// SHA-256 hex digest used for codes and tokens at rest
pub fn hash_secret(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Constant-time comparison of a candidate against a stored digest
pub fn verify_secret(candidate: &str, stored_hash: &str) -> bool {
    let computed = hash_secret(candidate);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Random 32-byte key, hex-encoded
pub fn generate_key() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Pull the first run of exactly `digits` digits out of an SMS body
///
/// Gateways and users add prefixes like "VERIFY 123456" or trailing signatures,
/// so the message is scanned rather than parsed strictly.
pub fn extract_code(message: &str, digits: usize) -> Option<String> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .find(|run| run.len() == digits)
        .map(str::to_string)
}
