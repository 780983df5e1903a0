/// In-process SMS gateway for development and tests
use super::{field, parse_received_at, IncomingSms, SmsGateway};
use crate::error::{GateError, GateResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A message "sent" through the mock gateway
#[derive(Debug, Clone, PartialEq)]
pub struct SentSms {
    pub phone: String,
    pub code: String,
    pub template_id: String,
    pub message_id: String,
}

/// Outbox owned by whoever constructs the gateway
#[derive(Debug, Default)]
pub struct MockSmsStore {
    sent: Mutex<Vec<SentSms>>,
}

impl MockSmsStore {
    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Most recent code sent to a phone
    pub fn last_code_for(&self, phone: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.phone == phone)
            .map(|m| m.code)
    }

    fn push(&self, sms: SentSms) -> GateResult<()> {
        self.sent
            .lock()
            .map_err(|_| GateError::Internal("mock SMS store poisoned".to_string()))?
            .push(sms);
        Ok(())
    }
}

pub struct MockSmsGateway {
    store: Arc<MockSmsStore>,
    virtual_number: String,
}

impl MockSmsGateway {
    pub fn new(store: Arc<MockSmsStore>, virtual_number: String) -> Self {
        Self {
            store,
            virtual_number,
        }
    }

    pub fn store(&self) -> Arc<MockSmsStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl SmsGateway for MockSmsGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send_otp(&self, phone: &str, code: &str, template_id: &str) -> GateResult<String> {
        let message_id = format!("mock-{}", Uuid::new_v4());
        self.store.push(SentSms {
            phone: phone.to_string(),
            code: code.to_string(),
            template_id: template_id.to_string(),
            message_id: message_id.clone(),
        })?;
        tracing::debug!("Mock SMS to {}: code sent ({})", phone, message_id);
        Ok(message_id)
    }

    fn virtual_number(&self) -> String {
        self.virtual_number.clone()
    }

    fn parse_incoming_webhook(&self, payload: &serde_json::Value) -> GateResult<IncomingSms> {
        let sender = field(payload, &["sender", "from"])
            .ok_or_else(|| GateError::Validation("Webhook missing sender".to_string()))?;
        let message = field(payload, &["message", "body"])
            .ok_or_else(|| GateError::Validation("Webhook missing message".to_string()))?;
        let gateway_message_id = field(payload, &["message_id", "id"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("mock-in-{}", Uuid::new_v4()));

        Ok(IncomingSms {
            sender: sender.to_string(),
            message: message.to_string(),
            received_at: parse_received_at(field(payload, &["received_at"])),
            gateway_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let store_a = Arc::new(MockSmsStore::default());
        let store_b = Arc::new(MockSmsStore::default());
        let a = MockSmsGateway::new(Arc::clone(&store_a), "+910000000000".to_string());
        let b = MockSmsGateway::new(Arc::clone(&store_b), "+910000000000".to_string());

        a.send_otp("+919876543210", "123456", "tpl").await.unwrap();
        b.send_otp("+919876543210", "654321", "tpl").await.unwrap();

        assert_eq!(store_a.sent().len(), 1);
        assert_eq!(store_a.last_code_for("+919876543210").unwrap(), "123456");
        assert_eq!(store_b.last_code_for("+919876543210").unwrap(), "654321");
    }

    #[test]
    fn test_parse_incoming() {
        let gateway = MockSmsGateway::new(Arc::new(MockSmsStore::default()), "+910".to_string());
        let sms = gateway
            .parse_incoming_webhook(&json!({
                "sender": "+919876543210",
                "message": "VERIFY 123456",
                "message_id": "in-1"
            }))
            .unwrap();
        assert_eq!(sms.sender, "+919876543210");
        assert_eq!(sms.gateway_message_id, "in-1");

        assert!(gateway.parse_incoming_webhook(&json!({"message": "x"})).is_err());
    }
}
