/// Campus Gate - device trust and QR presence verification service

use campus_gate::{
    config::ServerConfig, context::AppContext, error::GateResult, jobs::JobScheduler, metrics,
    server,
};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> GateResult<()> {
    metrics::mark_started();

    // Configuration first so it can supply the default filter
    let config = ServerConfig::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.logging.level.clone().into());
    let output = if config.logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(output).init();

    tracing::info!("Campus Gate v{}", env!("CARGO_PKG_VERSION"));

    let ctx = Arc::new(AppContext::new(config).await?);
    let jobs = Arc::new(JobScheduler::new(Arc::clone(&ctx))).start();
    tracing::info!("Started {} background jobs", jobs.len());

    let served = server::serve((*ctx).clone()).await;
    for job in jobs {
        job.abort();
    }
    served
}
