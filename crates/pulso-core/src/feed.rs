//! Feed types: the fixed event taxonomy, the persisted post, and the
//! transition events the normaliser hands to the feed queue.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::BillStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedType {
    BillCreated,
    BillMovement,
    VoteResult,
    AttendanceRecord,
    AnalysisReady,
    OrderCreated,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::BillCreated => "BILL_CREATED",
            FeedType::BillMovement => "BILL_MOVEMENT",
            FeedType::VoteResult => "VOTE_RESULT",
            FeedType::AttendanceRecord => "ATTENDANCE_RECORD",
            FeedType::AnalysisReady => "ANALYSIS_READY",
            FeedType::OrderCreated => "ORDER_CREATED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BILL_CREATED" => Some(FeedType::BillCreated),
            "BILL_MOVEMENT" => Some(FeedType::BillMovement),
            "VOTE_RESULT" => Some(FeedType::VoteResult),
            "ATTENDANCE_RECORD" => Some(FeedType::AttendanceRecord),
            "ANALYSIS_READY" => Some(FeedType::AnalysisReady),
            "ORDER_CREATED" => Some(FeedType::OrderCreated),
            _ => None,
        }
    }
}

/// Chronological append-only log entry. `tenant_id = None` means the post
/// is tenant-global (visible without a tenant scope).
#[derive(Debug, Clone, Serialize)]
pub struct FeedPost {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub post_type: FeedType,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
    pub entity_kind: Option<String>,
    pub entity_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub source_ref_id: Option<Uuid>,
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

/// Transition detected by the normaliser, carried as a `feed` queue job
/// payload. The snapshot fields are everything the feed generator needs so
/// it never re-reads raw tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEvent {
    BillCreated {
        bill_id: Uuid,
        external_id: String,
        title: String,
        authors: Vec<String>,
        source_ref_id: Uuid,
        tags: Vec<String>,
    },
    BillMovement {
        bill_id: Uuid,
        bill_external_id: String,
        bill_title: String,
        description: String,
        to_status: Option<BillStatus>,
        source_ref_id: Uuid,
        tags: Vec<String>,
    },
    VoteResult {
        vote_event_id: Uuid,
        title: String,
        affirmative: i32,
        negative: i32,
        abstentions: i32,
        absent: i32,
        source_ref_id: Uuid,
        tags: Vec<String>,
    },
    AttendanceRecord {
        session_id: Uuid,
        session_date: NaiveDate,
        present: i32,
        total: i32,
        absent: i32,
        source_ref_id: Uuid,
        tags: Vec<String>,
    },
    AnalysisReady {
        tenant_id: Uuid,
        module: String,
        top_insight: String,
    },
    OrderCreated {
        tenant_id: Uuid,
        order_id: Uuid,
        ordinal: i64,
        total: f64,
        source_ref_id: Uuid,
    },
}

impl FeedEvent {
    pub fn feed_type(&self) -> FeedType {
        match self {
            FeedEvent::BillCreated { .. } => FeedType::BillCreated,
            FeedEvent::BillMovement { .. } => FeedType::BillMovement,
            FeedEvent::VoteResult { .. } => FeedType::VoteResult,
            FeedEvent::AttendanceRecord { .. } => FeedType::AttendanceRecord,
            FeedEvent::AnalysisReady { .. } => FeedType::AnalysisReady,
            FeedEvent::OrderCreated { .. } => FeedType::OrderCreated,
        }
    }

    /// Tenant scope of the resulting post. Legislative events are global.
    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            FeedEvent::AnalysisReady { tenant_id, .. }
            | FeedEvent::OrderCreated { tenant_id, .. } => Some(*tenant_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_type_round_trips() {
        for t in [
            FeedType::BillCreated,
            FeedType::BillMovement,
            FeedType::VoteResult,
            FeedType::AttendanceRecord,
            FeedType::AnalysisReady,
            FeedType::OrderCreated,
        ] {
            assert_eq!(FeedType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn event_payloads_survive_queue_serialization() {
        let event = FeedEvent::BillMovement {
            bill_id: Uuid::new_v4(),
            bill_external_id: "B-1".into(),
            bill_title: "Ley de Transparencia".into(),
            description: "Pasa a comisión".into(),
            to_status: Some(BillStatus::InCommittee),
            source_ref_id: Uuid::new_v4(),
            tags: vec!["deputies".into()],
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["kind"], "bill_movement");
        let back: FeedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(back.feed_type(), FeedType::BillMovement);
        assert_eq!(back.tenant_id(), None);
    }
}
