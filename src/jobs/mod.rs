use crate::{context::AppContext, error::GateResult, metrics};
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, Instant, MissedTickBehavior},
};
use tracing::{error, info};

pub mod tasks;

/// Named background jobs
///
/// Every job is idempotent: a run that overlaps a request or repeats after a
/// partial failure leaves the same state as a single clean run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RotateActionPointKeys,
    ExpireDeviceTokens,
    ExpirePendingRegistrations,
    ExpireTransferRequests,
    ReportFlaggedUsers,
    HealthCheck,
}

impl Job {
    pub const ALL: [Job; 6] = [
        Job::RotateActionPointKeys,
        Job::ExpireDeviceTokens,
        Job::ExpirePendingRegistrations,
        Job::ExpireTransferRequests,
        Job::ReportFlaggedUsers,
        Job::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::RotateActionPointKeys => "rotate_action_point_keys",
            Job::ExpireDeviceTokens => "expire_device_tokens",
            Job::ExpirePendingRegistrations => "expire_pending_registrations",
            Job::ExpireTransferRequests => "expire_transfer_requests",
            Job::ReportFlaggedUsers => "report_flagged_users",
            Job::HealthCheck => "health_check",
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Job::RotateActionPointKeys => Duration::from_secs(60),
            Job::ExpireDeviceTokens => Duration::from_secs(3600),
            Job::ExpirePendingRegistrations => Duration::from_secs(900),
            Job::ExpireTransferRequests => Duration::from_secs(300),
            Job::ReportFlaggedUsers => Duration::from_secs(86400),
            Job::HealthCheck => Duration::from_secs(300),
        }
    }

    /// Run the job body once; returns the number of rows it touched
    async fn execute(&self, ctx: &AppContext) -> GateResult<u64> {
        match self {
            Job::RotateActionPointKeys => tasks::rotate_action_point_keys(ctx).await,
            Job::ExpireDeviceTokens => tasks::expire_device_tokens(ctx).await,
            Job::ExpirePendingRegistrations => tasks::expire_pending_registrations(ctx).await,
            Job::ExpireTransferRequests => tasks::expire_transfer_requests(ctx).await,
            Job::ReportFlaggedUsers => tasks::report_flagged_users(ctx).await,
            Job::HealthCheck => tasks::health_check(ctx).await,
        }
    }
}

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting background job scheduler");

        let handles = Job::ALL
            .into_iter()
            .map(|job| tokio::spawn(Self::job_loop(Arc::clone(&self), job)))
            .collect();

        info!("Background jobs started");
        handles
    }

    async fn job_loop(scheduler: Arc<Self>, job: Job) {
        let mut ticker = interval(job.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            // Failures are logged inside and retried on the next tick
            let _ = scheduler.run_once(job).await;
        }
    }

    /// Run a job immediately, recording the outcome
    pub async fn run_once(&self, job: Job) -> GateResult<u64> {
        let started = Instant::now();
        let result = job.execute(&self.context).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(count) => {
                metrics::record_background_job(job.name(), "success", elapsed);
                if *count > 0 {
                    info!("Job {} touched {} rows", job.name(), count);
                }
            }
            Err(e) => {
                metrics::record_background_job(job.name(), "failure", elapsed);
                error!("Job {} failed: {}", job.name(), e);
            }
        }

        result
    }
}
