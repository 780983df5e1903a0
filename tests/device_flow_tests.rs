//! Device registration, SMS verification, transfer and revocation over HTTP

mod common;

use axum::http::StatusCode;
use campus_gate::crypto::codes;
use common::{device_attrs, request, session, DEVICE_HEADER, PHONE};
use serde_json::json;

#[tokio::test]
async fn test_registration_and_token_delivery() {
    let app = common::app().await;

    let (status, body) = app
        .call(request(
            "POST",
            "/device/register",
            &[],
            Some(json!({ "phone": PHONE, "device": device_attrs("pixel-7-0001") })),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthenticated");

    let (device_id, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    assert!(!token.is_empty());

    // Redelivery of the same gateway message is a no-op
    let code = app.sms.last_code_for(PHONE).unwrap();
    let (status, outcome) = app
        .forward_sms(PHONE, &code, &format!("in-{}", device_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["status"], "duplicate");

    // Polls keep returning the token until the device has used it
    let auth = format!("Bearer {}", session("user-1", None));
    let status_uri = format!("/device/status?device_id={}", device_id);
    for _ in 0..2 {
        let (status, view) = app
            .call(request("GET", &status_uri, &[("authorization", auth.as_str())], None))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["status"], "active");
        assert_eq!(view["device_trust_token"], token.as_str());
    }

    let (status, _) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, view) = app
        .call(request("GET", &status_uri, &[("authorization", auth.as_str())], None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(view.get("device_trust_token").is_none());

    // Nobody else can collect it
    let other = format!("Bearer {}", session("user-2", None));
    let (status, _) = app
        .call(request("GET", &status_uri, &[("authorization", other.as_str())], None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .call(request(
            "POST",
            "/device/register",
            &[("authorization", auth.as_str())],
            Some(json!({ "phone": PHONE, "device": device_attrs("galaxy-s23-0002") })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Conflict");
}

#[tokio::test]
async fn test_identity_qr_requires_trusted_device() {
    let app = common::app().await;
    let (_, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let auth = format!("Bearer {}", session("user-1", None));

    let (status, body) = app
        .call(request("POST", "/device/qr-token", &[("authorization", auth.as_str())], None))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "DeviceNotRegistered");

    let (status, body) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, "not-a-token")],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "DeviceTrustInvalid");

    let (status, body) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some());
    assert_eq!(body["refresh_after_seconds"], 60);

    // Another user's session cannot ride on this device token
    let other = format!("Bearer {}", session("user-2", None));
    let (status, _) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", other.as_str()), (DEVICE_HEADER, token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_resend_replaces_code() {
    let app = common::app().await;
    let auth = format!("Bearer {}", session("user-2", None));

    let (status, challenge) = app
        .call(request(
            "POST",
            "/device/register",
            &[("authorization", auth.as_str())],
            Some(json!({ "phone": PHONE, "device": device_attrs("pixel-7-0001") })),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(challenge["virtual_number"], "+910000000000");
    assert_eq!(challenge["status"], "pending_sms_verification");
    let device_id = challenge["device_id"].as_str().unwrap().to_string();

    // Pin the first code so the replaced code is known to differ
    let first_code = "481516";
    sqlx::query("UPDATE device_trust SET verification_code_hash = ? WHERE id = ?")
        .bind(codes::hash_secret(first_code))
        .bind(&device_id)
        .execute(&app.ctx.db)
        .await
        .unwrap();

    let (status, resent) = app
        .call(request(
            "POST",
            "/device/resend-sms",
            &[("authorization", auth.as_str())],
            Some(json!({ "device_id": device_id })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.sms.sent().len(), 2);
    assert_eq!(
        resent["resends_remaining"].as_i64().unwrap(),
        challenge["resends_remaining"].as_i64().unwrap() - 1
    );

    let mut second_code = app.sms.last_code_for(PHONE).unwrap();
    while second_code == first_code {
        app.ctx.device_manager.resend("user-2", &device_id).await.unwrap();
        second_code = app.sms.last_code_for(PHONE).unwrap();
    }

    let (_, outcome) = app.forward_sms(PHONE, first_code, "in-old").await;
    assert_eq!(outcome["status"], "unmatched");

    // Code forwarded from a different SIM does not verify
    let (_, outcome) = app.forward_sms("+919800000001", &second_code, "in-other-sim").await;
    assert_eq!(outcome["status"], "unmatched");

    let (_, outcome) = app.forward_sms(PHONE, &second_code, "in-new").await;
    assert_eq!(outcome["status"], "activated");
    assert_eq!(outcome["device_id"], device_id.as_str());
}

#[tokio::test]
async fn test_webhook_secret_and_form_bodies() {
    let app = common::app().await;

    let (status, _) = app
        .call(request(
            "POST",
            "/webhooks/sms/incoming",
            &[("x-webhook-secret", "wrong")],
            Some(json!({ "sender": PHONE, "message": "123456" })),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let secret = app.ctx.config.authentication.sms_webhook_secret.clone();
    let form = axum::http::Request::builder()
        .method("POST")
        .uri(format!("/webhooks/sms/incoming?secret={}", secret))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(axum::body::Body::from(
            "sender=%2B919876543210&message=123456&message_id=form-1",
        ))
        .unwrap();
    let (status, outcome) = app.call(form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["status"], "unmatched");
}

#[tokio::test]
async fn test_transfer_moves_trust_to_new_device() {
    let app = common::app().await;
    let (old_device_id, old_token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let auth = format!("Bearer {}", session("user-1", None));

    let (status, initiated) = app
        .call(request(
            "POST",
            "/device/transfer/initiate",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, old_token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let code = initiated["transfer_code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 8);

    let (status, completed) = app
        .call(request(
            "POST",
            "/device/transfer/complete",
            &[("authorization", auth.as_str())],
            Some(json!({ "transfer_code": code, "device": device_attrs("galaxy-s23-0002") })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", completed);
    let new_token = completed["device_trust_token"].as_str().unwrap().to_string();
    assert_ne!(completed["device_id"], old_device_id.as_str());

    let (status, _) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, old_token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, new_token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Codes are single use
    let (status, body) = app
        .call(request(
            "POST",
            "/device/transfer/complete",
            &[("authorization", auth.as_str())],
            Some(json!({ "transfer_code": code, "device": device_attrs("iphone-15-0003") })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "TransferCodeInvalidOrExpired");

    let old = app.ctx.device_manager.get(&old_device_id).await.unwrap().unwrap();
    assert_eq!(old.revoke_reason.as_deref(), Some("transferred"));
}

#[tokio::test]
async fn test_revoke_then_register_again() {
    let app = common::app().await;
    let (_, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let auth = format!("Bearer {}", session("user-1", None));

    let (status, revoked) = app
        .call(request(
            "DELETE",
            "/device/revoke?reason=lost",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revoked["status"], "revoked");

    let (status, _) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    app.activate("user-1", "galaxy-s23-0002", PHONE).await;
}

#[tokio::test]
async fn test_sms_webhook_bypasses_anonymous_limit() {
    let mut config = campus_gate::config::ServerConfig::for_testing();
    config.rate_limit.enabled = true;
    config.rate_limit.unauthenticated_rps = 1;
    let app = common::app_with(config).await;

    // Drain the shared anonymous budget
    let (status, _) = app.call(request("GET", "/health/live", &[], None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.call(request("GET", "/health/live", &[], None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    for delivery in 0..3 {
        let (status, outcome) = app
            .forward_sms(PHONE, "no code here", &format!("gw-burst-{}", delivery))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "unmatched");
    }
}
