/// Cryptographic services: signed tokens, action point signatures, one-time codes
pub mod codes;
pub mod signature;
pub mod tokens;

pub use signature::ActionPointSigner;
pub use tokens::{DeviceTrustClaims, IdentityQrClaims, IdentityToken, TokenError, TokenService};
