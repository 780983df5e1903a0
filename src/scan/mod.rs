/// QR scanning: action points, validation engine and post-scan handlers

pub mod action_points;
pub mod engine;
pub mod geo;
pub mod handlers;
pub mod locks;

pub use action_points::{ActionPointManager, LocationQrPayload, NewActionPoint};
pub use engine::{IdentityScanRequest, LocationScanRequest, ScanEngine, ScanReceipt};
pub use handlers::{HandlerRegistry, HandlerReport, HandlerStatus, ScanEvent, ScanHandler};
