/// Device trust lifecycle
///
/// A user holds at most one active device. Registration is proven by an SMS
/// round trip from the claimed phone; afterwards the device carries a long
/// lived Device Trust Token and can mint short lived identity QRs.

pub mod fingerprint;
pub mod manager;
pub mod reset;
pub mod transfer;

pub use fingerprint::DeviceAttributes;
pub use manager::{DeviceManager, DeviceStatusView, RegisterDevice, RegistrationChallenge, WebhookOutcome};
pub use reset::{DeviceResetManager, FlaggedUser, ResetReason};
pub use transfer::{TransferCompleted, TransferInitiated, TransferManager};
