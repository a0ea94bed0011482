//! Feed generation: one post per normalised state transition, rendered
//! with the fixed taxonomy's title and body rules.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use pulso_core::feed::{FeedEvent, FeedType};
use pulso_core::{CoreError, CoreResult};
use pulso_queue::worker::{JobHandler, JobOutcome};
use pulso_queue::Job;
use pulso_storage::map_db_err;

use crate::PipelineCtx;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPost {
    pub post_type: FeedType,
    pub tenant_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub entity_kind: Option<String>,
    pub entity_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub source_ref_id: Option<Uuid>,
}

/// Integer percentage, 0 when the denominator is 0.
fn pct(part: i32, total: i32) -> i64 {
    if total == 0 {
        0
    } else {
        (100.0 * part as f64 / total as f64).round() as i64
    }
}

pub fn render(event: &FeedEvent) -> RenderedPost {
    match event {
        FeedEvent::BillCreated {
            bill_id,
            external_id,
            title,
            authors,
            source_ref_id,
            tags,
        } => RenderedPost {
            post_type: FeedType::BillCreated,
            tenant_id: None,
            title: external_id.clone(),
            body: if authors.is_empty() {
                title.clone()
            } else {
                format!("{} presented: {title}", authors.join(", "))
            },
            entity_kind: Some("bill".to_string()),
            entity_id: Some(*bill_id),
            tags: tags.clone(),
            source_ref_id: Some(*source_ref_id),
        },
        FeedEvent::BillMovement {
            bill_id,
            bill_title,
            description,
            to_status,
            source_ref_id,
            tags,
            ..
        } => RenderedPost {
            post_type: FeedType::BillMovement,
            tenant_id: None,
            title: bill_title.clone(),
            body: match to_status {
                Some(status) => format!("{description}. New status: {}", status.as_str()),
                None => description.clone(),
            },
            entity_kind: Some("bill".to_string()),
            entity_id: Some(*bill_id),
            tags: tags.clone(),
            source_ref_id: Some(*source_ref_id),
        },
        FeedEvent::VoteResult {
            vote_event_id,
            title,
            affirmative,
            negative,
            abstentions,
            absent,
            source_ref_id,
            tags,
        } => RenderedPost {
            post_type: FeedType::VoteResult,
            tenant_id: None,
            title: title.clone(),
            body: format!(
                "AFF {affirmative} / NEG {negative} / ABST {abstentions} / ABSENT {absent}"
            ),
            entity_kind: Some("vote_event".to_string()),
            entity_id: Some(*vote_event_id),
            tags: tags.clone(),
            source_ref_id: Some(*source_ref_id),
        },
        FeedEvent::AttendanceRecord {
            session_id,
            session_date,
            present,
            total,
            absent,
            source_ref_id,
            tags,
        } => RenderedPost {
            post_type: FeedType::AttendanceRecord,
            tenant_id: None,
            title: format!("Attendance: {session_date}"),
            body: format!(
                "Present {present}/{total} ({}%). Absent {absent}",
                pct(*present, *total)
            ),
            entity_kind: Some("session".to_string()),
            entity_id: Some(*session_id),
            tags: tags.clone(),
            source_ref_id: Some(*source_ref_id),
        },
        FeedEvent::AnalysisReady {
            tenant_id,
            module,
            top_insight,
        } => RenderedPost {
            post_type: FeedType::AnalysisReady,
            tenant_id: Some(*tenant_id),
            title: module.clone(),
            body: top_insight.clone(),
            entity_kind: Some("analysis".to_string()),
            entity_id: None,
            tags: Vec::new(),
            source_ref_id: None,
        },
        FeedEvent::OrderCreated {
            tenant_id,
            order_id,
            ordinal,
            total,
            source_ref_id,
        } => RenderedPost {
            post_type: FeedType::OrderCreated,
            tenant_id: Some(*tenant_id),
            title: format!("Order #{ordinal}"),
            body: format!("New order for {total:.2}"),
            entity_kind: Some("order".to_string()),
            entity_id: Some(*order_id),
            tags: Vec::new(),
            source_ref_id: Some(*source_ref_id),
        },
    }
}

pub async fn insert_post(pool: &PgPool, post: &RenderedPost) -> CoreResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO feed_posts (id, tenant_id, post_type, title, body, payload,
                                entity_kind, entity_id, tags, source_ref_id,
                                auto_generated, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, NOW())
        "#,
    )
    .bind(id)
    .bind(post.tenant_id)
    .bind(post.post_type.as_str())
    .bind(&post.title)
    .bind(&post.body)
    .bind(json!({ "title": post.title, "body": post.body }))
    .bind(&post.entity_kind)
    .bind(post.entity_id)
    .bind(&post.tags)
    .bind(post.source_ref_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(id)
}

#[derive(Debug, Deserialize)]
struct FeedJobPayload {
    event: FeedEvent,
}

pub struct FeedEmitHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for FeedEmitHandler {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome> {
        let payload: FeedJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(CoreError::schema)?;
        let post = render(&payload.event);
        insert_post(&self.ctx.db, &post).await?;
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pulso_core::model::BillStatus;

    #[test]
    fn bill_created_titles_by_external_id_and_names_authors() {
        let post = render(&FeedEvent::BillCreated {
            bill_id: Uuid::new_v4(),
            external_id: "B-2024-77".into(),
            title: "Acceso a la información pública".into(),
            authors: vec!["Ana Díaz".into(), "Juan Soto".into()],
            source_ref_id: Uuid::new_v4(),
            tags: vec![],
        });
        assert_eq!(post.title, "B-2024-77");
        assert_eq!(
            post.body,
            "Ana Díaz, Juan Soto presented: Acceso a la información pública"
        );
    }

    #[test]
    fn bill_movement_names_the_bill_and_new_status() {
        let post = render(&FeedEvent::BillMovement {
            bill_id: Uuid::new_v4(),
            bill_external_id: "B-1".into(),
            bill_title: "Ley de Transparencia".into(),
            description: "Gira a comisión".into(),
            to_status: Some(BillStatus::InCommittee),
            source_ref_id: Uuid::new_v4(),
            tags: vec![],
        });
        assert_eq!(post.title, "Ley de Transparencia");
        assert_eq!(post.body, "Gira a comisión. New status: IN_COMMITTEE");
    }

    #[test]
    fn vote_result_formats_tallies() {
        let post = render(&FeedEvent::VoteResult {
            vote_event_id: Uuid::new_v4(),
            title: "Votación en general".into(),
            affirmative: 120,
            negative: 80,
            abstentions: 5,
            absent: 52,
            source_ref_id: Uuid::new_v4(),
            tags: vec![],
        });
        assert_eq!(post.title, "Votación en general");
        assert_eq!(post.body, "AFF 120 / NEG 80 / ABST 5 / ABSENT 52");
    }

    #[test]
    fn attendance_formats_presence_and_percentage() {
        let post = render(&FeedEvent::AttendanceRecord {
            session_id: Uuid::new_v4(),
            session_date: NaiveDate::from_ymd_opt(2026, 6, 12).unwrap(),
            present: 3,
            total: 4,
            absent: 1,
            source_ref_id: Uuid::new_v4(),
            tags: vec![],
        });
        assert_eq!(post.title, "Attendance: 2026-06-12");
        assert_eq!(post.body, "Present 3/4 (75%). Absent 1");
    }

    #[test]
    fn attendance_with_no_records_reads_zero_percent() {
        let post = render(&FeedEvent::AttendanceRecord {
            session_id: Uuid::new_v4(),
            session_date: NaiveDate::from_ymd_opt(2026, 6, 12).unwrap(),
            present: 0,
            total: 0,
            absent: 0,
            source_ref_id: Uuid::new_v4(),
            tags: vec![],
        });
        assert_eq!(post.body, "Present 0/0 (0%). Absent 0");
    }

    #[test]
    fn analysis_ready_is_tenant_scoped() {
        let tenant_id = Uuid::new_v4();
        let post = render(&FeedEvent::AnalysisReady {
            tenant_id,
            module: "STOCK".into(),
            top_insight: "Sizing replenishment for Yerba 1kg".into(),
        });
        assert_eq!(post.tenant_id, Some(tenant_id));
        assert_eq!(post.title, "STOCK");
    }
}
