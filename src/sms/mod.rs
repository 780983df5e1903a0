/// SMS gateway abstraction
///
/// Registration sends the verification code to the claimed phone; the user
/// forwards it to the gateway's virtual number from the same SIM, and the
/// provider calls our incoming webhook. Every provider satisfies the single
/// [`SmsGateway`] contract.

pub mod mock;
pub mod msg91;
pub mod twilio;

pub use mock::{MockSmsGateway, MockSmsStore};

use crate::{
    config::{SmsConfig, SmsProvider},
    error::{GateError, GateResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Normalized incoming message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingSms {
    pub sender: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
    pub gateway_message_id: String,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Provider name, used in logs and metrics
    fn name(&self) -> &'static str;

    /// Deliver a verification code, returning the provider message id
    async fn send_otp(&self, phone: &str, code: &str, template_id: &str) -> GateResult<String>;

    /// Number users forward their code to
    fn virtual_number(&self) -> String;

    /// Translate the provider's webhook body into an [`IncomingSms`]
    fn parse_incoming_webhook(&self, payload: &serde_json::Value) -> GateResult<IncomingSms>;
}

/// Build the configured gateway
pub fn build_gateway(config: &SmsConfig) -> GateResult<Arc<dyn SmsGateway>> {
    let gateway: Arc<dyn SmsGateway> = match config.provider {
        SmsProvider::Mock => Arc::new(MockSmsGateway::new(
            Arc::new(MockSmsStore::default()),
            config.virtual_number.clone(),
        )),
        SmsProvider::Msg91 => Arc::new(msg91::Msg91Gateway::new(config)?),
        SmsProvider::Twilio => Arc::new(twilio::TwilioGateway::new(config)?),
    };
    tracing::info!("SMS gateway: {}", gateway.name());
    Ok(gateway)
}

/// Normalize a phone number to E.164, defaulting to the Indian country code
pub fn normalize_phone(raw: &str) -> GateResult<String> {
    let has_plus = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let normalized = if has_plus {
        format!("+{}", digits)
    } else if digits.len() == 10 {
        format!("+91{}", digits)
    } else if digits.len() == 12 && digits.starts_with("91") {
        format!("+{}", digits)
    } else if digits.len() == 11 && digits.starts_with('0') {
        format!("+91{}", &digits[1..])
    } else {
        format!("+{}", digits)
    };

    let len = normalized.len() - 1;
    if !(8..=15).contains(&len) {
        return Err(GateError::Validation(format!("Invalid phone number: {}", raw)));
    }
    Ok(normalized)
}

/// Read a string field from a webhook body, trying several names
pub(crate) fn field<'a>(payload: &'a serde_json::Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| payload.get(*name).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
}

/// Parse a provider timestamp, falling back to now
pub(crate) fn parse_received_at(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
