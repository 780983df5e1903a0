/// Background task implementations
use crate::{context::AppContext, db, error::GateResult, metrics};
use chrono::Utc;

/// Replace rotation keys of action points whose interval elapsed
pub async fn rotate_action_point_keys(ctx: &AppContext) -> GateResult<u64> {
    ctx.action_points.rotate_due_keys(Utc::now()).await
}

/// Expire active devices holding a lapsed trust token
pub async fn expire_device_tokens(ctx: &AppContext) -> GateResult<u64> {
    ctx.device_manager.expire_stale_tokens().await
}

pub async fn expire_pending_registrations(ctx: &AppContext) -> GateResult<u64> {
    ctx.device_manager.expire_pending_registrations().await
}

pub async fn expire_transfer_requests(ctx: &AppContext) -> GateResult<u64> {
    ctx.transfer_manager.expire_stale().await
}

/// Surface users who keep getting their device reset
pub async fn report_flagged_users(ctx: &AppContext) -> GateResult<u64> {
    let fraud = &ctx.config.fraud;
    let flagged = ctx
        .reset_manager
        .flagged_users(None, fraud.reset_window_days, fraud.reset_threshold)
        .await?;

    metrics::set_flagged_users(flagged.len());
    for user in &flagged {
        tracing::warn!(
            "User {} of {} had {} device resets in the last {} days (last at {})",
            user.user_id,
            user.tenant_id,
            user.reset_count,
            fraud.reset_window_days,
            user.last_reset_at
        );
    }

    Ok(flagged.len() as u64)
}

/// Health check - verify the database answers
pub async fn health_check(ctx: &AppContext) -> GateResult<u64> {
    db::test_connection(&ctx.db).await?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ServerConfig,
        context::AppContext,
        db::{self, device::DeviceStatus, scan::QrMode},
        device::manager::tests::{activate_device, PHONE},
        error::GateError,
        jobs::{Job, JobScheduler},
        scan::{action_points::tests::new_point, HandlerRegistry},
        sms::{MockSmsGateway, MockSmsStore},
    };
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn scheduler() -> (JobScheduler, Arc<AppContext>) {
        let (scheduler, ctx, _) = scheduler_with_sms().await;
        (scheduler, ctx)
    }

    async fn scheduler_with_sms() -> (JobScheduler, Arc<AppContext>, Arc<MockSmsStore>) {
        let config = ServerConfig::for_testing();
        let pool = db::create_memory_pool().await.unwrap();
        let store = Arc::new(MockSmsStore::default());
        let gateway = Arc::new(MockSmsGateway::new(
            Arc::clone(&store),
            config.sms.virtual_number.clone(),
        ));
        let ctx = Arc::new(AppContext::from_parts(
            config,
            pool,
            gateway,
            HandlerRegistry::with_defaults(),
        ));
        (JobScheduler::new(Arc::clone(&ctx)), ctx, store)
    }

    #[tokio::test]
    async fn test_lapsed_device_tokens_expire() {
        let (scheduler, ctx, store) = scheduler_with_sms().await;
        let (device_id, token) =
            activate_device(&ctx.device_manager, &store, "user-1", "pixel-7-0001", PHONE).await;

        // Still valid: nothing to sweep
        assert_eq!(scheduler.run_once(Job::ExpireDeviceTokens).await.unwrap(), 0);

        sqlx::query("UPDATE device_trust SET token_expires_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(1))
            .bind(&device_id)
            .execute(&ctx.db)
            .await
            .unwrap();

        assert_eq!(scheduler.run_once(Job::ExpireDeviceTokens).await.unwrap(), 1);
        assert_eq!(scheduler.run_once(Job::ExpireDeviceTokens).await.unwrap(), 0);

        let device = ctx.device_manager.get(&device_id).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Expired);
        assert!(ctx.device_manager.active_for_user("user-1").await.unwrap().is_none());
        assert!(matches!(
            ctx.device_manager.verify_device_token(&token).await,
            Err(GateError::DeviceTrustInvalid)
        ));
    }

    #[tokio::test]
    async fn test_rotation_job_is_idempotent() {
        let (scheduler, ctx) = scheduler().await;
        let mut request = new_point("class_attendance", QrMode::ModeB, "LT-2");
        request.qr_rotation_minutes = 5;
        let point = ctx.action_points.create("college-42", "admin-1", request).await.unwrap();

        // Not due yet
        assert_eq!(scheduler.run_once(Job::RotateActionPointKeys).await.unwrap(), 0);

        sqlx::query("UPDATE qr_action_point SET rotated_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(6))
            .bind(&point.id)
            .execute(&ctx.db)
            .await
            .unwrap();

        assert_eq!(scheduler.run_once(Job::RotateActionPointKeys).await.unwrap(), 1);
        assert_eq!(scheduler.run_once(Job::RotateActionPointKeys).await.unwrap(), 0);

        let rotated = ctx.action_points.get(&point.id).await.unwrap().unwrap();
        assert_ne!(rotated.rotation_key, point.rotation_key);
    }

    #[tokio::test]
    async fn test_every_job_runs_on_empty_database() {
        let (scheduler, _ctx) = scheduler().await;
        for job in Job::ALL {
            assert_eq!(scheduler.run_once(job).await.unwrap(), 0, "{}", job.name());
        }
    }

    #[test]
    fn test_job_schedule() {
        let names: Vec<_> = Job::ALL.iter().map(|j| j.name()).collect();
        assert!(names.contains(&"rotate_action_point_keys"));
        assert_eq!(Job::RotateActionPointKeys.interval().as_secs(), 60);
        assert_eq!(Job::ExpireTransferRequests.interval().as_secs(), 300);
        assert_eq!(Job::ReportFlaggedUsers.interval().as_secs(), 86400);
    }
}
