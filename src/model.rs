use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").unwrap());

pub fn is_valid_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub fn is_valid_time(s: &str) -> bool {
    TIME_RE.is_match(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Held,
    Booked,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "AVAILABLE",
            SlotStatus::Held => "HELD",
            SlotStatus::Booked => "BOOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(SlotStatus::Available),
            "HELD" => Some(SlotStatus::Held),
            "BOOKED" => Some(SlotStatus::Booked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clinic {
    pub id: String,
    pub name: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub clinic_id: String,
    pub date: String,
    pub time: String,
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<i64>,
}

/// Booking details carried inside an `APPOINTMENT_REQUEST` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentDetails {
    pub patient_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Message payload, keyed by the message's type tag. An undecodable payload
/// surfaces as `Unparseable` instead of being dropped or nulled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    #[serde(rename = "APPOINTMENT_REQUEST")]
    AppointmentRequest(AppointmentDetails),
    #[serde(rename = "UNPARSEABLE")]
    Unparseable { raw: String },
}

impl MessagePayload {
    /// Decode a stored payload; never fails, never drops.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| MessagePayload::Unparseable {
            raw: raw.to_string(),
        })
    }
}

/// Wire shape of an outbox entry as returned by `/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub clinic_id: String,
    pub kind: String,
    pub payload: MessagePayload,
    pub created_at: i64,
}

pub const MESSAGE_KIND_APPOINTMENT_REQUEST: &str = "APPOINTMENT_REQUEST";

/// Body of `POST /book`. Either `slot_id` targets a concrete slot, or
/// `clinic_id` addresses a clinic directly for a general request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<String>,
    pub patient_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One availability entry in `POST /slots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub date: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub dates: Vec<String>,
    pub slots: Vec<SlotEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        }
    }
}

/// Local mirror of a synced appointment request. Shares its id with the
/// originating message; created once, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentRequest {
    pub id: String,
    pub patient_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: RequestStatus,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_and_time_validation() {
        assert!(is_valid_date("2024-06-01"));
        assert!(!is_valid_date("2024-13-01"));
        assert!(!is_valid_date("01/06/2024"));
        assert!(is_valid_time("09:30"));
        assert!(!is_valid_time("24:00"));
        assert!(!is_valid_time("9:30"));
    }

    #[test]
    fn payload_decodes_tagged_union() {
        let raw = r#"{"type":"APPOINTMENT_REQUEST","patientName":"Ana","date":"2024-06-01"}"#;
        match MessagePayload::decode(raw) {
            MessagePayload::AppointmentRequest(details) => {
                assert_eq!(details.patient_name, "Ana");
                assert_eq!(details.date.as_deref(), Some("2024-06-01"));
            }
            other => panic!("expected appointment request, got {other:?}"),
        }
    }

    #[test]
    fn broken_payload_becomes_unparseable() {
        match MessagePayload::decode("{not json") {
            MessagePayload::Unparseable { raw } => assert_eq!(raw, "{not json"),
            other => panic!("expected unparseable, got {other:?}"),
        }
    }

    #[test]
    fn slot_status_roundtrip() {
        for status in [SlotStatus::Available, SlotStatus::Held, SlotStatus::Booked] {
            assert_eq!(SlotStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SlotStatus::parse("TAKEN"), None);
    }
}
