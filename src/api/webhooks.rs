/// Incoming SMS webhook
///
/// Providers post either JSON or form-encoded bodies. The shared secret is
/// accepted from a header or a `secret` query parameter since not every
/// provider can set custom headers.
use crate::{
    api::middleware::WEBHOOK_SECRET_HEADER,
    context::AppContext,
    device::WebhookOutcome,
    error::{GateError, GateResult},
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;

pub fn routes() -> Router<AppContext> {
    Router::new().route("/webhooks/sms/incoming", post(incoming_sms))
}

#[derive(Debug, Default, Deserialize)]
struct WebhookQuery {
    secret: Option<String>,
}

fn secret_matches(presented: Option<&str>, expected: &str) -> bool {
    match presented {
        Some(presented) if !expected.is_empty() => {
            presented.as_bytes().ct_eq(expected.as_bytes()).into()
        }
        _ => false,
    }
}

/// Decode `a=1&b=2` into a flat JSON object
fn parse_form(body: &[u8]) -> GateResult<Value> {
    let text = std::str::from_utf8(body)
        .map_err(|_| GateError::Validation("Webhook body is not UTF-8".to_string()))?;

    let mut fields = Map::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|v| v.into_owned())
                .map_err(|_| GateError::Validation("Malformed form field".to_string()))
        };
        fields.insert(decode(key)?, Value::String(decode(value)?));
    }
    Ok(Value::Object(fields))
}

fn parse_body(headers: &HeaderMap, body: &[u8]) -> GateResult<Value> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        parse_form(body)
    } else {
        serde_json::from_slice(body)
            .map_err(|e| GateError::Validation(format!("Invalid webhook JSON: {}", e)))
    }
}

async fn incoming_sms(
    State(ctx): State<AppContext>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> GateResult<Json<WebhookOutcome>> {
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.secret.as_deref());

    if !secret_matches(presented, &ctx.config.authentication.sms_webhook_secret) {
        tracing::warn!("SMS webhook rejected: bad or missing secret");
        return Err(GateError::Unauthenticated("Invalid webhook secret".to_string()));
    }

    let payload = parse_body(&headers, &body)?;
    let sms = ctx.sms_gateway.parse_incoming_webhook(&payload)?;
    let outcome = ctx.device_manager.reconcile_incoming_sms(&sms).await?;

    Ok(Json(outcome))
}
