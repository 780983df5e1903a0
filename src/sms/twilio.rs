/// Twilio gateway (Programmable Messaging)
use super::{field, IncomingSms, SmsGateway};
use crate::{
    config::SmsConfig,
    error::{GateError, GateResult},
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: Option<String>,
    message: Option<String>,
}

pub struct TwilioGateway {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
    virtual_number: String,
}

impl TwilioGateway {
    pub fn new(config: &SmsConfig) -> GateResult<Self> {
        if config.auth_token.is_empty() {
            return Err(GateError::Validation("Twilio auth token required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GateError::Internal(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            account_sid: config.account_id.clone(),
            auth_token: config.auth_token.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            virtual_number: config.virtual_number.clone(),
        })
    }

    /// Twilio has no server-side templates; the body is rendered here
    fn render(&self, code: &str) -> String {
        format!(
            "Your device verification code is {}. Forward this message to {} from this phone to finish registering.",
            code, self.virtual_number
        )
    }
}

#[async_trait]
impl SmsGateway for TwilioGateway {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn send_otp(&self, phone: &str, code: &str, _template_id: &str) -> GateResult<String> {
        let body = self.render(code);
        let params = [
            ("To", phone),
            ("From", self.virtual_number.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .client
            .post(format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                self.base_url, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| GateError::SmsGateway(format!("twilio request failed: {}", e)))?;

        let status = response.status();
        let body: MessageResponse = response
            .json()
            .await
            .map_err(|e| GateError::SmsGateway(format!("twilio response unreadable: {}", e)))?;

        match (status.is_success(), body.sid) {
            (true, Some(sid)) => Ok(sid),
            _ => Err(GateError::SmsGateway(format!(
                "twilio rejected message ({}): {}",
                status,
                body.message.unwrap_or_default()
            ))),
        }
    }

    fn virtual_number(&self) -> String {
        self.virtual_number.clone()
    }

    fn parse_incoming_webhook(&self, payload: &serde_json::Value) -> GateResult<IncomingSms> {
        let sender = field(payload, &["From"])
            .ok_or_else(|| GateError::Validation("Webhook missing From".to_string()))?;
        let message = field(payload, &["Body"])
            .ok_or_else(|| GateError::Validation("Webhook missing Body".to_string()))?;
        let sid = field(payload, &["MessageSid", "SmsSid"])
            .ok_or_else(|| GateError::Validation("Webhook missing MessageSid".to_string()))?;

        // Twilio webhooks carry no timestamp
        Ok(IncomingSms {
            sender: sender.to_string(),
            message: message.to_string(),
            received_at: Utc::now(),
            gateway_message_id: format!("twilio:{}", sid),
        })
    }
}
