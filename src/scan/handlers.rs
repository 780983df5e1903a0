/// Per-action-type side effects run after a successful scan
///
/// The registry is assembled once at startup and never mutated. Handler
/// failures are reported back to the caller but never undo the scan log.
use crate::db::scan::ActionType;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

/// A recorded successful scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanEvent {
    pub scan_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub action_point_id: String,
    pub action_type: ActionType,
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,
    pub scanned_at: DateTime<Utc>,
    /// Scan time in the institution's timezone
    pub local_time: DateTime<FixedOffset>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

#[async_trait]
pub trait ScanHandler: Send + Sync {
    async fn handle(&self, event: &ScanEvent) -> Result<serde_json::Value, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Ok,
    Failed,
    NoHandler,
}

/// Handler result attached to the scan receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerReport {
    pub status: HandlerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pair a handler with the action type it serves
pub fn entry<H: ScanHandler + 'static>(
    action_type: ActionType,
    handler: H,
) -> (ActionType, Arc<dyn ScanHandler>) {
    (action_type, Arc::new(handler))
}

pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ScanHandler>>,
}

impl HandlerRegistry {
    pub fn new(entries: Vec<(ActionType, Arc<dyn ScanHandler>)>) -> Self {
        Self {
            handlers: entries.into_iter().collect(),
        }
    }

    /// Registry with the built-in handler for every action type
    pub fn with_defaults() -> Self {
        Self::new(vec![
            entry(ActionType::MessEntry, MessHandler),
            entry(ActionType::LibraryEntry, PresenceHandler),
            entry(ActionType::LibraryCheckout, LibraryCheckoutHandler::default()),
            entry(ActionType::HostelEntry, HostelHandler::entry()),
            entry(ActionType::HostelExit, HostelHandler::exit()),
            entry(ActionType::ClassAttendance, PresenceHandler),
            entry(ActionType::ExamHall, PresenceHandler),
            entry(ActionType::ClinicalPosting, PresenceHandler),
        ])
    }

    pub fn get(&self, action_type: ActionType) -> Option<&Arc<dyn ScanHandler>> {
        self.handlers.get(&action_type)
    }

    pub async fn dispatch(&self, event: &ScanEvent) -> HandlerReport {
        let Some(handler) = self.get(event.action_type) else {
            return HandlerReport {
                status: HandlerStatus::NoHandler,
                result: None,
                error: None,
            };
        };

        match handler.handle(event).await {
            Ok(result) => HandlerReport {
                status: HandlerStatus::Ok,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                tracing::error!(
                    "Handler for {} failed on scan {}: {}",
                    event.action_type.as_str(),
                    event.scan_id,
                    e
                );
                HandlerReport {
                    status: HandlerStatus::Failed,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Meal served at a given local time
pub fn classify_meal(time: NaiveTime) -> &'static str {
    match time.hour() {
        6..=10 => "breakfast",
        11..=15 => "lunch",
        16..=18 => "snacks",
        19..=22 => "dinner",
        _ => "off_hours",
    }
}

pub struct MessHandler;

#[async_trait]
impl ScanHandler for MessHandler {
    async fn handle(&self, event: &ScanEvent) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({
            "meal": classify_meal(event.local_time.time()),
            "mess_id": event.linked_entity_id,
        }))
    }
}

pub struct LibraryCheckoutHandler {
    pub loan_days: i64,
}

impl Default for LibraryCheckoutHandler {
    fn default() -> Self {
        Self { loan_days: 14 }
    }
}

#[async_trait]
impl ScanHandler for LibraryCheckoutHandler {
    async fn handle(&self, event: &ScanEvent) -> Result<serde_json::Value, HandlerError> {
        let due = event.local_time + Duration::days(self.loan_days);
        Ok(json!({
            "library_id": event.linked_entity_id,
            "due_date": due.date_naive().to_string(),
        }))
    }
}

pub struct HostelHandler {
    direction: &'static str,
    curfew_start: NaiveTime,
    curfew_end: NaiveTime,
}

impl HostelHandler {
    fn new(direction: &'static str) -> Self {
        Self {
            direction,
            curfew_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            curfew_end: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn entry() -> Self {
        Self::new("in")
    }

    pub fn exit() -> Self {
        Self::new("out")
    }

    fn after_curfew(&self, time: NaiveTime) -> bool {
        time >= self.curfew_start || time < self.curfew_end
    }
}

#[async_trait]
impl ScanHandler for HostelHandler {
    async fn handle(&self, event: &ScanEvent) -> Result<serde_json::Value, HandlerError> {
        let late = self.direction == "in" && self.after_curfew(event.local_time.time());
        Ok(json!({
            "hostel_id": event.linked_entity_id,
            "direction": self.direction,
            "curfew_violation": late,
        }))
    }
}

/// Attendance-style touchpoints: the scan log is the record
pub struct PresenceHandler;

#[async_trait]
impl ScanHandler for PresenceHandler {
    async fn handle(&self, event: &ScanEvent) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({
            "marked": event.action_type.as_str(),
            "entity_type": event.linked_entity_type,
            "entity_id": event.linked_entity_id,
            "local_date": event.local_time.date_naive().to_string(),
        }))
    }
}
