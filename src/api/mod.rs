/// API routes and handlers
pub mod admin;
pub mod device;
pub mod health;
pub mod middleware;
pub mod scan;
pub mod webhooks;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(device::routes())
        .merge(webhooks::routes())
        .merge(scan::routes())
        .merge(admin::routes())
}
