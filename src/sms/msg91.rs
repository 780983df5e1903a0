/// MSG91 gateway (template based OTP API)
use super::{field, parse_received_at, IncomingSms, SmsGateway};
use crate::{
    config::SmsConfig,
    error::{GateError, GateResult},
};
use async_trait::async_trait;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://control.msg91.com";

#[derive(Debug, Deserialize)]
struct OtpResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct Msg91Gateway {
    client: reqwest::Client,
    auth_key: String,
    base_url: String,
    virtual_number: String,
}

impl Msg91Gateway {
    pub fn new(config: &SmsConfig) -> GateResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GateError::Internal(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            auth_key: config.account_id.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            virtual_number: config.virtual_number.clone(),
        })
    }
}

#[async_trait]
impl SmsGateway for Msg91Gateway {
    fn name(&self) -> &'static str {
        "msg91"
    }

    async fn send_otp(&self, phone: &str, code: &str, template_id: &str) -> GateResult<String> {
        // MSG91 expects the number without the leading '+'
        let mobile = phone.trim_start_matches('+');

        let response = self
            .client
            .post(format!("{}/api/v5/otp", self.base_url))
            .header("authkey", &self.auth_key)
            .query(&[("template_id", template_id), ("mobile", mobile), ("otp", code)])
            .send()
            .await
            .map_err(|e| GateError::SmsGateway(format!("msg91 request failed: {}", e)))?;

        let status = response.status();
        let body: OtpResponse = response
            .json()
            .await
            .map_err(|e| GateError::SmsGateway(format!("msg91 response unreadable: {}", e)))?;

        if !status.is_success() || body.kind != "success" {
            return Err(GateError::SmsGateway(format!(
                "msg91 rejected OTP ({}): {}",
                status,
                body.message.unwrap_or_default()
            )));
        }

        body.request_id
            .ok_or_else(|| GateError::SmsGateway("msg91 returned no request id".to_string()))
    }

    fn virtual_number(&self) -> String {
        self.virtual_number.clone()
    }

    fn parse_incoming_webhook(&self, payload: &serde_json::Value) -> GateResult<IncomingSms> {
        let sender = field(payload, &["sender", "mobile"])
            .ok_or_else(|| GateError::Validation("Webhook missing sender".to_string()))?;
        let message = field(payload, &["message", "content"])
            .ok_or_else(|| GateError::Validation("Webhook missing message".to_string()))?;
        let id = field(payload, &["requestId", "request_id", "id"])
            .ok_or_else(|| GateError::Validation("Webhook missing message id".to_string()))?;

        Ok(IncomingSms {
            sender: sender.to_string(),
            message: message.to_string(),
            received_at: parse_received_at(field(payload, &["rcvd", "received_at"])),
            gateway_message_id: format!("msg91:{}", id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, SmsProvider};
    use serde_json::json;

    #[test]
    fn test_parse_incoming() {
        let mut config = ServerConfig::for_testing().sms;
        config.provider = SmsProvider::Msg91;
        config.account_id = "auth-key".to_string();
        let gateway = Msg91Gateway::new(&config).unwrap();

        let sms = gateway
            .parse_incoming_webhook(&json!({
                "mobile": "919876543210",
                "content": "482913",
                "requestId": "abc"
            }))
            .unwrap();
        assert_eq!(sms.sender, "919876543210");
        assert_eq!(sms.message, "482913");
        assert_eq!(sms.gateway_message_id, "msg91:abc");
    }
}
