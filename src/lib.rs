/// Campus Gate - device trust and QR presence verification
///
/// Binds each user to one SMS-verified device, issues short-lived identity
/// QR codes and signed location codes, and validates every scan through a
/// layered security chain into an append-only scan log.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod device;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod rate_limit;
pub mod scan;
pub mod security;
pub mod server;
pub mod sms;

pub use context::AppContext;
pub use error::{GateError, GateResult};
