//! Civic adapter: public legislative datasets served as CKAN-style JSON.
//! Pull-only; the portal pushes no change notifications.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use pulso_core::model::DataType;
use pulso_core::{CoreError, CoreResult};

use crate::{
    source_key, AdapterError, FetchContext, RawPayload, RegistrationOutcome, SourceAdapter,
};

pub struct CivicAdapter {
    base_url: String,
}

impl CivicAdapter {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn dataset_path(data_type: DataType) -> Option<&'static str> {
        match data_type {
            DataType::Legislators => Some("datasets/legislators.json"),
            DataType::Bills => Some("datasets/bills.json"),
            DataType::Votes => Some("datasets/votes.json"),
            DataType::Attendance => Some("datasets/attendance.json"),
            DataType::Sessions => Some("datasets/sessions.json"),
            _ => None,
        }
    }
}

#[async_trait]
impl SourceAdapter for CivicAdapter {
    fn source_name(&self) -> &'static str {
        "civic"
    }

    fn data_types(&self) -> Vec<DataType> {
        DataType::civic_types().to_vec()
    }

    async fn fetch(
        &self,
        ctx: &FetchContext<'_>,
        data_type: DataType,
    ) -> Result<RawPayload, AdapterError> {
        let path = Self::dataset_path(data_type).ok_or_else(|| {
            AdapterError::Schema(format!(
                "civic portal does not serve data type {}",
                data_type.as_str()
            ))
        })?;

        let url = format!("{}/{path}", self.base_url);
        let key = source_key("civic", &self.base_url, data_type);
        let response = ctx.http.fetch_bytes(ctx.run_id, &key, &url, None).await?;

        Ok(RawPayload {
            source_key: key,
            data_type,
            content_type: "application/json".to_string(),
            body: response.body,
            fetched_at: Utc::now(),
        })
    }

    async fn register_change_notifications(
        &self,
        _ctx: &FetchContext<'_>,
        _callback_base: &str,
    ) -> Result<Vec<RegistrationOutcome>, AdapterError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegislatorsPayload {
    pub legislators: Vec<CivicLegislator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicLegislator {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub block: Option<String>,
    pub province: Option<String>,
    pub active: bool,
    /// `deputies` or `senate`.
    pub chamber: String,
    pub term_start: Option<NaiveDate>,
    pub term_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillsPayload {
    pub bills: Vec<CivicBill>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicBill {
    pub id: String,
    pub title: String,
    /// Current status as published by the portal, e.g. `IN_COMMITTEE`.
    pub status: String,
    #[serde(rename = "type")]
    pub bill_type: Option<String>,
    pub presented_date: Option<NaiveDate>,
    pub period: i32,
    #[serde(default)]
    pub authors: Vec<CivicBillAuthor>,
    /// Full movement history in portal order; the normaliser appends only
    /// the entries beyond what it already holds.
    #[serde(default)]
    pub movements: Vec<CivicMovement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicBillAuthor {
    pub legislator_id: String,
    /// `AUTHOR` or `COAUTHOR`.
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicMovement {
    pub description: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VotesPayload {
    pub vote_events: Vec<CivicVoteEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicVoteEvent {
    pub id: String,
    pub session_id: Option<String>,
    pub title: String,
    pub date: Option<NaiveDate>,
    pub result: Option<String>,
    pub affirmative: i32,
    pub negative: i32,
    pub abstentions: i32,
    pub absent: i32,
    #[serde(default)]
    pub votes: Vec<CivicVote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicVote {
    pub legislator_id: String,
    /// `AFFIRM`, `NEG`, `ABST` or `ABSENT`.
    pub vote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttendancePayload {
    pub sessions: Vec<CivicSessionAttendance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicSessionAttendance {
    pub session_id: String,
    pub date: NaiveDate,
    pub chamber: String,
    pub records: Vec<CivicAttendanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicAttendanceRecord {
    pub legislator_id: String,
    /// `PRESENT`, `ABSENT` or `JUSTIFIED`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsPayload {
    pub sessions: Vec<CivicSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CivicSession {
    pub id: String,
    pub date: NaiveDate,
    pub chamber: String,
}

pub fn parse_legislators(bytes: &[u8]) -> CoreResult<LegislatorsPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_bills(bytes: &[u8]) -> CoreResult<BillsPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_votes(bytes: &[u8]) -> CoreResult<VotesPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_attendance(bytes: &[u8]) -> CoreResult<AttendancePayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_sessions(bytes: &[u8]) -> CoreResult<SessionsPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bills_payload_parses_with_nested_history() {
        let raw = r#"{
            "bills": [{
                "id": "B-2024-77",
                "title": "Acceso a la información pública",
                "status": "IN_COMMITTEE",
                "type": "LAW",
                "presented_date": "2024-03-04",
                "period": 2024,
                "authors": [
                    {"legislator_id": "L-1", "role": "AUTHOR"},
                    {"legislator_id": "L-9", "role": "COAUTHOR"}
                ],
                "movements": [
                    {"description": "Presentado", "from_status": null,
                     "to_status": "PRESENTED", "date": "2024-03-04"},
                    {"description": "Gira a comisión", "from_status": "PRESENTED",
                     "to_status": "IN_COMMITTEE", "date": "2024-03-18"}
                ]
            }]
        }"#;
        let parsed = parse_bills(raw.as_bytes()).expect("parse");
        assert_eq!(parsed.bills[0].movements.len(), 2);
        assert_eq!(parsed.bills[0].authors[0].role, "AUTHOR");
    }

    #[test]
    fn vote_payload_parses_tallies_and_individual_votes() {
        let raw = r#"{
            "vote_events": [{
                "id": "V-55",
                "session_id": "S-12",
                "title": "Votación en general",
                "date": "2024-06-12",
                "result": "APPROVED",
                "affirmative": 2, "negative": 1, "abstentions": 0, "absent": 1,
                "votes": [
                    {"legislator_id": "L-1", "vote": "AFFIRM"},
                    {"legislator_id": "L-2", "vote": "AFFIRM"},
                    {"legislator_id": "L-3", "vote": "NEG"},
                    {"legislator_id": "L-4", "vote": "ABSENT"}
                ]
            }]
        }"#;
        let parsed = parse_votes(raw.as_bytes()).expect("parse");
        let event = &parsed.vote_events[0];
        assert_eq!(
            event.affirmative + event.negative + event.abstentions + event.absent,
            event.votes.len() as i32
        );
    }

    #[test]
    fn structural_mismatch_is_a_schema_error() {
        let err = parse_legislators(br#"{"legislators": [{"id": "L-1"}]}"#).unwrap_err();
        assert_eq!(err.code(), "source_schema");
        let err = parse_sessions(br#"{"sessions": 3}"#).unwrap_err();
        assert_eq!(err.code(), "source_schema");
    }
}
