/// QR action point and scan log models
use crate::{
    error::{GateError, GateResult},
    security::SecurityLevel,
};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Who reads whom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum QrMode {
    /// Scanner device reads a person's identity QR
    ModeA,
    /// Person's device reads a fixed location QR
    ModeB,
}

impl QrMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QrMode::ModeA => "mode_a",
            QrMode::ModeB => "mode_b",
        }
    }
}

/// Institutional touchpoint kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    MessEntry,
    LibraryEntry,
    LibraryCheckout,
    HostelEntry,
    HostelExit,
    ClassAttendance,
    ExamHall,
    ClinicalPosting,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::MessEntry,
        ActionType::LibraryEntry,
        ActionType::LibraryCheckout,
        ActionType::HostelEntry,
        ActionType::HostelExit,
        ActionType::ClassAttendance,
        ActionType::ExamHall,
        ActionType::ClinicalPosting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MessEntry => "mess_entry",
            ActionType::LibraryEntry => "library_entry",
            ActionType::LibraryCheckout => "library_checkout",
            ActionType::HostelEntry => "hostel_entry",
            ActionType::HostelExit => "hostel_exit",
            ActionType::ClassAttendance => "class_attendance",
            ActionType::ExamHall => "exam_hall",
            ActionType::ClinicalPosting => "clinical_posting",
        }
    }

    pub fn from_str(s: &str) -> GateResult<Self> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| GateError::Validation(format!("Invalid action type: {}", s)))
    }
}

/// Configuration of a physical touchpoint
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QrActionPoint {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub action_type: String,
    pub location_code: String,
    pub qr_mode: QrMode,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_radius_meters: Option<f64>,
    pub qr_rotation_minutes: i64,
    #[serde(skip_serializing)]
    pub rotation_key: String,
    pub rotated_at: DateTime<Utc>,
    pub duplicate_window_minutes: i64,
    pub required_security_level: i64,
    pub active_from: Option<NaiveTime>,
    pub active_until: Option<NaiveTime>,
    /// Comma-separated weekday numbers, Monday = 0
    pub active_days: Option<String>,
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl QrActionPoint {
    pub fn action(&self) -> GateResult<ActionType> {
        ActionType::from_str(&self.action_type)
    }

    pub fn required_level(&self) -> SecurityLevel {
        SecurityLevel::from_i64(self.required_security_level).unwrap_or(SecurityLevel::Strict)
    }

    /// Geofence center and radius, when fully configured
    pub fn geofence(&self) -> Option<(f64, f64, f64)> {
        match (self.gps_latitude, self.gps_longitude, self.gps_radius_meters) {
            (Some(lat), Some(lon), Some(radius)) if radius > 0.0 => Some((lat, lon, radius)),
            _ => None,
        }
    }
}

pub const ACTION_POINT_COLUMNS: &str = "id, tenant_id, name, action_type, location_code, qr_mode, \
     gps_latitude, gps_longitude, gps_radius_meters, qr_rotation_minutes, rotation_key, \
     rotated_at, duplicate_window_minutes, required_security_level, active_from, active_until, \
     active_days, linked_entity_type, linked_entity_id, is_active, created_by, created_at";

/// Final classification of a scan attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum ScanOutcome {
    Success,
    Duplicate,
    Rejected,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Success => "success",
            ScanOutcome::Duplicate => "duplicate",
            ScanOutcome::Rejected => "rejected",
        }
    }
}

/// Append-only record of a scan attempt
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QrScanLog {
    pub id: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub scanner_user_id: Option<String>,
    pub action_point_id: String,
    pub action_type: Option<String>,
    pub qr_mode: QrMode,
    pub validation_result: ScanOutcome,
    pub rejection_reason: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub geo_validated: Option<bool>,
    pub device_validated: bool,
    pub scanned_at: DateTime<Utc>,
}

pub const SCAN_LOG_COLUMNS: &str = "id, tenant_id, user_id, scanner_user_id, action_point_id, \
     action_type, qr_mode, validation_result, rejection_reason, gps_latitude, gps_longitude, \
     geo_validated, device_validated, scanned_at";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_from_str() {
        assert_eq!(ActionType::from_str("mess_entry").unwrap(), ActionType::MessEntry);
        assert_eq!(
            ActionType::from_str("clinical_posting").unwrap(),
            ActionType::ClinicalPosting
        );
        assert!(ActionType::from_str("gym").is_err());
    }
}
