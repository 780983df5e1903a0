/// Router assembly and the HTTP listener
use crate::{
    api::middleware::{
        BIOMETRIC_HEADER, DEVICE_TRUST_HEADER, GPS_LATITUDE_HEADER, GPS_LONGITUDE_HEADER,
        QR_TOKEN_HEADER,
    },
    context::AppContext,
    error::{GateError, GateResult},
    metrics,
    rate_limit::rate_limit_middleware,
};
use axum::{
    extract::{MatchedPath, Request},
    http::{header, HeaderName, Method},
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::time::Instant;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Scanner apps run in browsers too, so every credential header must pass CORS
fn cors_layer() -> CorsLayer {
    let credential_headers = [
        DEVICE_TRUST_HEADER,
        QR_TOKEN_HEADER,
        GPS_LATITUDE_HEADER,
        GPS_LONGITUDE_HEADER,
        BIOMETRIC_HEADER,
    ]
    .map(HeaderName::from_static);

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(
            [header::CONTENT_TYPE, header::AUTHORIZATION]
                .into_iter()
                .chain(credential_headers)
                .collect::<Vec<_>>(),
        )
}

/// Fully layered router with state applied
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .merge(crate::api::routes())
        .fallback(unknown_route)
        .with_state(ctx.clone())
        .layer(middleware::from_fn_with_state(ctx, rate_limit_middleware))
        .layer(middleware::from_fn(track_http_metrics))
        .layer(cors_layer())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Count requests by route template, not raw path
async fn track_http_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn unknown_route() -> GateError {
    GateError::NotFound("Endpoint not found".to_string())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, draining connections");
}

/// Bind and serve until interrupted
pub async fn serve(ctx: AppContext) -> GateResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GateError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!(
        "Campus Gate listening on {} ({}, SMS via {})",
        addr,
        ctx.service_url(),
        ctx.sms_gateway.name()
    );

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GateError::Internal(format!("Server error: {}", e)))
}
