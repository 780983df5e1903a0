/// Application context and dependency injection
use crate::{
    config::ServerConfig,
    crypto::{ActionPointSigner, TokenService},
    db,
    device::{DeviceManager, DeviceResetManager, TransferManager},
    error::{GateError, GateResult},
    rate_limit::RateLimiter,
    scan::{ActionPointManager, HandlerRegistry, ScanEngine},
    security::SecurityChain,
    sms::{self, SmsGateway},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub tokens: Arc<TokenService>,
    pub sms_gateway: Arc<dyn SmsGateway>,
    // Device lifecycle
    pub device_manager: Arc<DeviceManager>,
    pub transfer_manager: Arc<TransferManager>,
    pub reset_manager: Arc<DeviceResetManager>,
    // Scanning
    pub action_points: Arc<ActionPointManager>,
    pub security_chain: Arc<SecurityChain>,
    pub scan_engine: Arc<ScanEngine>,
    // Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> GateResult<Self> {
        config.validate()?;

        if !config.storage.data_directory.exists() {
            tokio::fs::create_dir_all(&config.storage.data_directory)
                .await
                .map_err(|e| {
                    GateError::Internal(format!(
                        "Failed to create directory {:?}: {}",
                        config.storage.data_directory, e
                    ))
                })?;
        }

        let db = db::create_pool(&config.storage.database, (&config.storage).into()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let gateway = sms::build_gateway(&config.sms)?;

        Ok(Self::from_parts(
            config,
            db,
            gateway,
            HandlerRegistry::with_defaults(),
        ))
    }

    /// Wire every service over an already migrated pool
    pub fn from_parts(
        config: ServerConfig,
        db: SqlitePool,
        sms_gateway: Arc<dyn SmsGateway>,
        handlers: HandlerRegistry,
    ) -> Self {
        let tokens = Arc::new(TokenService::new(
            &config.authentication,
            config.device.trust_token_ttl_days,
            config.device.identity_token_ttl_seconds,
            config.device.identity_refresh_seconds,
        ));

        let device_manager = Arc::new(DeviceManager::new(
            db.clone(),
            Arc::clone(&tokens),
            Arc::clone(&sms_gateway),
            config.device.clone(),
            config.sms.otp_template_id.clone(),
        ));
        let transfer_manager = Arc::new(TransferManager::new(
            db.clone(),
            Arc::clone(&device_manager),
            Arc::clone(&tokens),
            config.device.transfer_code_ttl_minutes,
        ));
        let reset_manager = Arc::new(DeviceResetManager::new(
            db.clone(),
            Arc::clone(&device_manager),
        ));

        let signer = Arc::new(ActionPointSigner::new(
            &config.authentication.action_point_secret,
        ));
        let action_points = Arc::new(ActionPointManager::new(db.clone(), signer));

        let security_chain = Arc::new(SecurityChain::new(
            config.authentication.session_secret.clone(),
            Arc::clone(&tokens),
            Arc::clone(&device_manager),
        ));

        let scan_engine = Arc::new(ScanEngine::new(
            db.clone(),
            Arc::clone(&security_chain),
            Arc::clone(&tokens),
            Arc::clone(&device_manager),
            Arc::clone(&action_points),
            Arc::new(handlers),
            config.scan.local_utc_offset_minutes,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        Self {
            config: Arc::new(config),
            db,
            tokens,
            sms_gateway,
            device_manager,
            transfer_manager,
            reset_manager,
            action_points,
            security_chain,
            scan_engine,
            rate_limiter,
        }
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.config
            .authentication
            .admin_user_ids
            .iter()
            .any(|id| id == user_id)
    }
}
