//! End-to-end scans through the HTTP surface

mod common;

use axum::http::StatusCode;
use campus_gate::{
    db::scan::ScanOutcome,
    scan::LocationScanRequest,
    security::RequestCredentials,
};
use common::{request, session, TestApp, DEVICE_HEADER, PHONE};
use serde_json::{json, Value};

const GUARD_PHONE: &str = "+919812345678";

async fn create_point(app: &TestApp, body: Value) -> String {
    let admin = format!("Bearer {}", session("admin-1", None));
    let (status, point) = app
        .call(request(
            "POST",
            "/admin/action-points",
            &[("authorization", admin.as_str())],
            Some(body),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", point);
    point["id"].as_str().unwrap().to_string()
}

async fn mess_point(app: &TestApp) -> (String, Value) {
    let id = create_point(
        app,
        json!({
            "name": "Main mess",
            "action_type": "mess_entry",
            "location_code": "MESS-A",
            "qr_mode": "mode_b",
            "duplicate_window_minutes": 30
        }),
    )
    .await;
    let payload = app
        .ctx
        .action_points
        .signed_payload(&app.ctx.action_points.get(&id).await.unwrap().unwrap())
        .unwrap();
    (id, serde_json::to_value(payload).unwrap())
}

#[tokio::test]
async fn test_location_scan_then_duplicate() {
    let app = common::app().await;
    let (_, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let (point_id, payload) = mess_point(&app).await;
    let auth = format!("Bearer {}", session("user-1", None));
    let headers = [("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())];

    let (status, receipt) = app
        .call(request("POST", "/scan/location", &headers, Some(json!({ "payload": payload }))))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", receipt);
    assert_eq!(receipt["outcome"], "success");
    assert_eq!(receipt["action_point_id"], point_id.as_str());
    assert_eq!(receipt["user_id"], "user-1");
    assert!(receipt["handler"].is_object());

    let (status, body) = app
        .call(request("POST", "/scan/location", &headers, Some(json!({ "payload": payload }))))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DuplicateScanRejected");

    let (status, history) = app
        .call(request("GET", "/scan/history", &[("authorization", auth.as_str())], None))
        .await;
    assert_eq!(status, StatusCode::OK);
    let results: Vec<&str> = history["scans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["validation_result"].as_str().unwrap())
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.contains(&"success"));
    assert!(results.contains(&"duplicate"));
}

#[tokio::test]
async fn test_chain_stops_at_first_missing_level() {
    let app = common::app().await;
    app.activate("user-1", "pixel-7-0001", PHONE).await;
    let (_, payload) = mess_point(&app).await;

    // Session is checked before the device even when a device token is sent
    let (status, body) = app
        .call(request(
            "POST",
            "/scan/location",
            &[(DEVICE_HEADER, "garbage")],
            Some(json!({ "payload": payload })),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthenticated");

    let auth = format!("Bearer {}", session("user-1", None));
    let (status, body) = app
        .call(request(
            "POST",
            "/scan/location",
            &[("authorization", auth.as_str())],
            Some(json!({ "payload": payload })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "DeviceNotRegistered");

    let (status, body) = app
        .call(request(
            "POST",
            "/scan/location",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, "garbage")],
            Some(json!({ "payload": payload })),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "DeviceTrustInvalid");
}

#[tokio::test]
async fn test_tampered_location_payload() {
    let app = common::app().await;
    let (_, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let (_, mut payload) = mess_point(&app).await;
    payload["location_code"] = json!("MESS-B");

    let auth = format!("Bearer {}", session("user-1", None));
    let (status, body) = app
        .call(request(
            "POST",
            "/scan/location",
            &[("authorization", auth.as_str()), (DEVICE_HEADER, token.as_str())],
            Some(json!({ "payload": payload })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "LocationSignatureMismatch");
}

#[tokio::test]
async fn test_identity_scan_by_guard() {
    let app = common::app().await;
    let (_, student_token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let (_, guard_token) = app.activate("guard-1", "galaxy-a54-0009", GUARD_PHONE).await;
    let point_id = create_point(
        &app,
        json!({
            "name": "Hostel gate",
            "action_type": "hostel_entry",
            "location_code": "HOSTEL-1",
            "qr_mode": "mode_a"
        }),
    )
    .await;

    let student = format!("Bearer {}", session("user-1", None));
    let (status, identity) = app
        .call(request(
            "POST",
            "/device/qr-token",
            &[("authorization", student.as_str()), (DEVICE_HEADER, student_token.as_str())],
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let guard = format!("Bearer {}", session("guard-1", None));
    let (status, receipt) = app
        .call(request(
            "POST",
            "/scan/identity",
            &[("authorization", guard.as_str()), (DEVICE_HEADER, guard_token.as_str())],
            Some(json!({
                "identity_token": identity["token"],
                "action_point_id": point_id
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", receipt);
    assert_eq!(receipt["user_id"], "user-1");
    assert_eq!(receipt["outcome"], "success");

    // The subject's history carries who scanned them
    let history = app.ctx.scan_engine.history("user-1", 10).await.unwrap();
    assert_eq!(history[0].scanner_user_id.as_deref(), Some("guard-1"));

    // A location point cannot be used for identity scans
    let (mess_id, _) = mess_point(&app).await;
    let (status, body) = app
        .call(request(
            "POST",
            "/scan/identity",
            &[("authorization", guard.as_str()), (DEVICE_HEADER, guard_token.as_str())],
            Some(json!({
                "identity_token": identity["token"],
                "action_point_id": mess_id
            })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ScanRejected");
}

#[tokio::test]
async fn test_concurrent_scans_record_one_success() {
    let app = common::file_app().await;
    let (_, token) = app.activate("user-1", "pixel-7-0001", PHONE).await;
    let (_, payload) = mess_point(&app).await;

    let creds = RequestCredentials {
        session_token: Some(session("user-1", None)),
        device_trust_token: Some(token),
        ..Default::default()
    };
    let scan = LocationScanRequest {
        payload: serde_json::from_value(payload).unwrap(),
        latitude: None,
        longitude: None,
    };

    let attempts = (0..10).map(|_| app.ctx.scan_engine.scan_location(&creds, scan.clone()));
    let receipts: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let successes = receipts
        .iter()
        .filter(|r| r.outcome == ScanOutcome::Success)
        .count();
    let duplicates = receipts
        .iter()
        .filter(|r| r.outcome == ScanOutcome::Duplicate)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(duplicates, 9);
}
