/// Configuration management for Campus Gate
use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub device: DeviceConfig,
    pub sms: SmsConfig,
    pub scan: ScanConfig,
    pub fraud: FraudConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

/// Secrets and admin identities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret of the institutional session JWT (issued by the platform auth service)
    pub session_secret: String,
    /// Signs Device Trust Tokens
    pub device_trust_secret: String,
    /// Signs QR Identity Tokens
    pub qr_identity_secret: String,
    /// Platform-wide key for action point QR signatures
    pub action_point_secret: String,
    /// Shared secret expected on the incoming SMS webhook
    pub sms_webhook_secret: String,
    /// User ids allowed on admin endpoints regardless of session role
    pub admin_user_ids: Vec<String>,
}

/// Device lifecycle tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub trust_token_ttl_days: i64,
    pub identity_token_ttl_seconds: i64,
    pub identity_refresh_seconds: i64,
    pub verification_code_ttl_minutes: i64,
    pub transfer_code_ttl_minutes: i64,
    pub max_resends: i64,
    /// Resends allowed per user in a 10 minute window
    pub resend_quota: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            trust_token_ttl_days: 180,
            identity_token_ttl_seconds: 300,
            identity_refresh_seconds: 60,
            verification_code_ttl_minutes: 10,
            transfer_code_ttl_minutes: 10,
            max_resends: 5,
            resend_quota: 3,
        }
    }
}

/// Which SMS provider backs the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsProvider {
    Mock,
    Msg91,
    Twilio,
}

impl SmsProvider {
    pub fn from_str(s: &str) -> GateResult<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(SmsProvider::Mock),
            "msg91" => Ok(SmsProvider::Msg91),
            "twilio" => Ok(SmsProvider::Twilio),
            _ => Err(GateError::Validation(format!("Unknown SMS provider: {}", s))),
        }
    }
}

/// SMS gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub provider: SmsProvider,
    /// MSG91 auth key or Twilio account SID
    pub account_id: String,
    /// Twilio auth token (unused by MSG91)
    pub auth_token: String,
    pub sender_id: String,
    pub otp_template_id: String,
    /// Number that users forward verification codes to
    pub virtual_number: String,
    pub base_url: Option<String>,
}

/// Scan engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Institution local time offset from UTC, used for active hours and meal windows
    pub local_utc_offset_minutes: i32,
}

/// Admin reset fraud signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    pub reset_window_days: i64,
    pub reset_threshold: i64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub authenticated_rps: u32,
    pub unauthenticated_rps: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit one JSON object per event instead of human-readable lines
    pub json: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> GateResult<String> {
    env::var(key).map_err(|_| GateError::Validation(format!("{} is required", key)))
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> GateResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("GATE_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("GATE_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| GateError::Validation("Invalid port number".to_string()))?;

        let data_directory: PathBuf = env::var("GATE_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("GATE_DATABASE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("gate.sqlite"));
        let max_connections = env::var("GATE_DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let admin_user_ids = env::var("GATE_ADMIN_USER_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<String>>();

        let authentication = AuthConfig {
            session_secret: required("GATE_SESSION_SECRET")?,
            device_trust_secret: required("GATE_DEVICE_TRUST_SECRET")?,
            qr_identity_secret: required("GATE_QR_IDENTITY_SECRET")?,
            action_point_secret: required("GATE_ACTION_POINT_SECRET")?,
            sms_webhook_secret: required("GATE_SMS_WEBHOOK_SECRET")?,
            admin_user_ids,
        };

        let defaults = DeviceConfig::default();
        let device = DeviceConfig {
            trust_token_ttl_days: env_or("GATE_TRUST_TOKEN_TTL_DAYS", defaults.trust_token_ttl_days),
            identity_token_ttl_seconds: env_or(
                "GATE_IDENTITY_TOKEN_TTL_SECONDS",
                defaults.identity_token_ttl_seconds,
            ),
            identity_refresh_seconds: env_or(
                "GATE_IDENTITY_REFRESH_SECONDS",
                defaults.identity_refresh_seconds,
            ),
            verification_code_ttl_minutes: env_or(
                "GATE_VERIFICATION_CODE_TTL_MINUTES",
                defaults.verification_code_ttl_minutes,
            ),
            transfer_code_ttl_minutes: env_or(
                "GATE_TRANSFER_CODE_TTL_MINUTES",
                defaults.transfer_code_ttl_minutes,
            ),
            max_resends: env_or("GATE_MAX_RESENDS", defaults.max_resends),
            resend_quota: env_or("GATE_RESEND_QUOTA", defaults.resend_quota),
        };

        let provider =
            SmsProvider::from_str(&env::var("GATE_SMS_PROVIDER").unwrap_or_else(|_| "mock".to_string()))?;
        let sms = SmsConfig {
            provider,
            account_id: env::var("GATE_SMS_ACCOUNT_ID").unwrap_or_default(),
            auth_token: env::var("GATE_SMS_AUTH_TOKEN").unwrap_or_default(),
            sender_id: env::var("GATE_SMS_SENDER_ID").unwrap_or_else(|_| "CMPGTE".to_string()),
            otp_template_id: env::var("GATE_SMS_OTP_TEMPLATE_ID")
                .unwrap_or_else(|_| "device_verification".to_string()),
            virtual_number: env::var("GATE_SMS_VIRTUAL_NUMBER")
                .unwrap_or_else(|_| "+910000000000".to_string()),
            base_url: env::var("GATE_SMS_BASE_URL").ok(),
        };

        let scan = ScanConfig {
            local_utc_offset_minutes: env_or("GATE_LOCAL_UTC_OFFSET_MINUTES", 330),
        };

        let fraud = FraudConfig {
            reset_window_days: env_or("GATE_FRAUD_RESET_WINDOW_DAYS", 30),
            reset_threshold: env_or("GATE_FRAUD_RESET_THRESHOLD", 3),
        };

        let rate_limit = RateLimitConfig {
            enabled: env_or("GATE_RATE_LIMITS_ENABLED", true),
            authenticated_rps: env_or("GATE_RATE_LIMIT_AUTHENTICATED_RPS", 100),
            unauthenticated_rps: env_or("GATE_RATE_LIMIT_UNAUTHENTICATED_RPS", 10),
        };

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "campus_gate=debug,tower_http=debug".to_string());

        Ok(ServerConfig {
            service: ServiceConfig { hostname, port },
            storage: StorageConfig {
                data_directory,
                database,
                max_connections,
                busy_timeout_secs: 5,
            },
            authentication,
            device,
            sms,
            scan,
            fraud,
            rate_limit,
            logging: LoggingConfig {
                level: log_level,
                json: env_or("GATE_LOG_JSON", false),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> GateResult<()> {
        if self.service.hostname.is_empty() {
            return Err(GateError::Validation("Hostname cannot be empty".to_string()));
        }

        let secrets = [
            ("session secret", &self.authentication.session_secret),
            ("device trust secret", &self.authentication.device_trust_secret),
            ("QR identity secret", &self.authentication.qr_identity_secret),
            ("action point secret", &self.authentication.action_point_secret),
            ("SMS webhook secret", &self.authentication.sms_webhook_secret),
        ];
        for (name, secret) in secrets {
            if secret.len() < 32 {
                return Err(GateError::Validation(format!(
                    "{} must be at least 32 characters",
                    name
                )));
            }
        }

        if self.device.identity_refresh_seconds >= self.device.identity_token_ttl_seconds {
            return Err(GateError::Validation(
                "Identity token refresh interval must be shorter than its lifetime".to_string(),
            ));
        }

        if self.sms.provider != SmsProvider::Mock && self.sms.account_id.is_empty() {
            return Err(GateError::Validation(
                "SMS account id required for production providers".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration for tests and local development
    pub fn for_testing() -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                data_directory: PathBuf::from("./data"),
                database: PathBuf::from(":memory:"),
                max_connections: 1,
                busy_timeout_secs: 5,
            },
            authentication: AuthConfig {
                session_secret: "test-session-secret-for-testing-only!".to_string(),
                device_trust_secret: "test-device-trust-secret-for-testing!".to_string(),
                qr_identity_secret: "test-qr-identity-secret-for-testing!!".to_string(),
                action_point_secret: "test-action-point-secret-for-testing!".to_string(),
                sms_webhook_secret: "test-sms-webhook-secret-for-testing!!".to_string(),
                admin_user_ids: vec!["admin-1".to_string()],
            },
            device: DeviceConfig::default(),
            sms: SmsConfig {
                provider: SmsProvider::Mock,
                account_id: String::new(),
                auth_token: String::new(),
                sender_id: "CMPGTE".to_string(),
                otp_template_id: "device_verification".to_string(),
                virtual_number: "+910000000000".to_string(),
                base_url: None,
            },
            scan: ScanConfig {
                local_utc_offset_minutes: 330,
            },
            fraud: FraudConfig {
                reset_window_days: 30,
                reset_threshold: 3,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                authenticated_rps: 100,
                unauthenticated_rps: 10,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }
}
