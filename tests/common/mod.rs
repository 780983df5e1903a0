//! Shared harness: an in-process router over a fresh database
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use campus_gate::{
    auth::{issue_session_token, SessionClaims},
    config::ServerConfig,
    db,
    scan::HandlerRegistry,
    server::build_router,
    sms::{MockSmsGateway, MockSmsStore},
    AppContext,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const TENANT: &str = "college-42";
pub const PHONE: &str = "+919876543210";
pub const DEVICE_HEADER: &str = "x-device-trust-token";

pub struct TestApp {
    pub ctx: AppContext,
    pub router: Router,
    pub sms: Arc<MockSmsStore>,
    _dir: Option<TempDir>,
}

fn assemble(config: ServerConfig, pool: sqlx::SqlitePool, dir: Option<TempDir>) -> TestApp {
    let sms = Arc::new(MockSmsStore::default());
    let gateway = Arc::new(MockSmsGateway::new(
        Arc::clone(&sms),
        config.sms.virtual_number.clone(),
    ));
    let ctx = AppContext::from_parts(config, pool, gateway, HandlerRegistry::with_defaults());
    TestApp {
        router: build_router(ctx.clone()),
        ctx,
        sms,
        _dir: dir,
    }
}

/// App over a single-connection in-memory database
pub async fn app() -> TestApp {
    app_with(ServerConfig::for_testing()).await
}

pub async fn app_with(config: ServerConfig) -> TestApp {
    assemble(config, db::create_memory_pool().await.unwrap(), None)
}

/// App over a file database with a real connection pool
pub async fn file_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::create_pool(&dir.path().join("gate.db"), db::DatabaseOptions::default())
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    assemble(ServerConfig::for_testing(), pool, Some(dir))
}

pub fn session(user_id: &str, role: Option<&str>) -> String {
    session_in(TENANT, user_id, role)
}

pub fn session_in(tenant: &str, user_id: &str, role: Option<&str>) -> String {
    let config = ServerConfig::for_testing();
    issue_session_token(
        &SessionClaims {
            sub: user_id.to_string(),
            tenant: tenant.to_string(),
            user_type: "student".to_string(),
            role: role.map(str::to_string),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        },
        &config.authentication.session_secret,
    )
    .unwrap()
}

pub fn device_attrs(hardware_id: &str) -> Value {
    json!({
        "device_id": hardware_id,
        "platform": "android",
        "model": "Pixel 7",
        "screen_width": 1080,
        "screen_height": 2400,
        "screen_density": 2.625
    })
}

pub fn request(
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

impl TestApp {
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    /// Deliver an incoming SMS the way the gateway would
    pub async fn forward_sms(&self, from: &str, message: &str, message_id: &str) -> (StatusCode, Value) {
        let secret = self.ctx.config.authentication.sms_webhook_secret.clone();
        self.call(request(
            "POST",
            "/webhooks/sms/incoming",
            &[("x-webhook-secret", secret.as_str())],
            Some(json!({ "sender": from, "message": message, "message_id": message_id })),
        ))
        .await
    }

    /// Register, verify over SMS and collect the trust token
    pub async fn activate(&self, user_id: &str, hardware_id: &str, phone: &str) -> (String, String) {
        let auth = format!("Bearer {}", session(user_id, None));
        let (status, challenge) = self
            .call(request(
                "POST",
                "/device/register",
                &[("authorization", auth.as_str())],
                Some(json!({ "phone": phone, "device": device_attrs(hardware_id) })),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", challenge);
        let device_id = challenge["device_id"].as_str().unwrap().to_string();

        let code = self.sms.last_code_for(phone).unwrap();
        let (status, outcome) = self
            .forward_sms(phone, &code, &format!("in-{}", device_id))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "activated");

        let (status, view) = self
            .call(request(
                "GET",
                &format!("/device/status?device_id={}", device_id),
                &[("authorization", auth.as_str())],
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = view["device_trust_token"].as_str().unwrap().to_string();
        (device_id, token)
    }
}
