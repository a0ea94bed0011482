//! Legislative normalizers. Bills carry their movement history; the
//! normaliser appends only the tail beyond what it already holds, advances
//! the bill's current status along the linear path, and emits one feed
//! event per detected transition.

use chrono::Datelike;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_adapters::civic::{
    self, CivicBill, CivicMovement, CivicSessionAttendance, CivicVoteEvent,
};
use pulso_core::feed::FeedEvent;
use pulso_core::model::{AttendanceStatus, AuthorRole, BillStatus, Chamber, VoteChoice};
use pulso_core::{CoreError, CoreResult};
use pulso_storage::map_db_err;

use crate::normalize::NormalizeOutcome;
use crate::repo::legislator_id_by_external;

/// Advance-only rule for a bill's current status: a `to_status` earlier
/// than the current one stays in history without moving the bill.
pub fn resolve_bill_status(current: Option<BillStatus>, incoming: BillStatus) -> BillStatus {
    match current {
        None => incoming,
        Some(cur) if cur.advances_to(incoming) => incoming,
        Some(cur) => cur,
    }
}

/// The movements not yet persisted, given how many the store already
/// holds. The portal publishes the full history in order.
pub fn movements_to_append(all: &[CivicMovement], existing_count: usize) -> &[CivicMovement] {
    if existing_count >= all.len() {
        &[]
    } else {
        &all[existing_count..]
    }
}

fn parse_chamber(raw: &str) -> CoreResult<Chamber> {
    Chamber::parse(raw).ok_or_else(|| CoreError::schema(format!("unknown chamber {raw:?}")))
}

fn parse_status(raw: &str) -> CoreResult<BillStatus> {
    BillStatus::parse(raw).ok_or_else(|| CoreError::schema(format!("unknown bill status {raw:?}")))
}

pub async fn normalize_legislators(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = civic::parse_legislators(bytes)?;

    // Validate the full batch before the first write.
    for legislator in &payload.legislators {
        parse_chamber(&legislator.chamber)?;
    }

    let mut outcome = NormalizeOutcome::default();
    for legislator in &payload.legislators {
        sqlx::query(
            r#"
            INSERT INTO legislators (id, tenant_id, external_id, first_name, last_name,
                                     block, province, active, chamber, term_start,
                                     term_end, source_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id, external_id) DO UPDATE SET
                   first_name = EXCLUDED.first_name,
                   last_name = EXCLUDED.last_name,
                   block = EXCLUDED.block,
                   province = EXCLUDED.province,
                   active = EXCLUDED.active,
                   chamber = EXCLUDED.chamber,
                   term_start = EXCLUDED.term_start,
                   term_end = EXCLUDED.term_end,
                   source_ref_id = EXCLUDED.source_ref_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(&legislator.id)
        .bind(&legislator.first_name)
        .bind(&legislator.last_name)
        .bind(&legislator.block)
        .bind(&legislator.province)
        .bind(legislator.active)
        .bind(legislator.chamber.as_str())
        .bind(legislator.term_start)
        .bind(legislator.term_end)
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;
    }
    Ok(outcome)
}

pub async fn normalize_bills(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = civic::parse_bills(bytes)?;

    for bill in &payload.bills {
        parse_status(&bill.status)?;
        for movement in &bill.movements {
            if let Some(to) = &movement.to_status {
                parse_status(to)?;
            }
        }
    }

    let mut outcome = NormalizeOutcome::default();
    for bill in &payload.bills {
        normalize_one_bill(pool, tenant_id, source_ref_id, bill, &mut outcome).await?;
    }
    Ok(outcome)
}

async fn normalize_one_bill(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bill: &CivicBill,
    outcome: &mut NormalizeOutcome,
) -> CoreResult<()> {
    let existing = sqlx::query(
        "SELECT id, status FROM bills WHERE tenant_id = $1 AND external_id = $2",
    )
    .bind(tenant_id)
    .bind(&bill.id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;

    let (bill_id, current_status, is_new) = match existing {
        Some(row) => {
            let id: Uuid = row.try_get("id").map_err(map_db_err)?;
            let status_raw: String = row.try_get("status").map_err(map_db_err)?;
            (id, Some(parse_status(&status_raw)?), false)
        }
        None => (Uuid::new_v4(), None, true),
    };

    // The payload's own status field also obeys the advance-only rule.
    let mut status = resolve_bill_status(current_status, parse_status(&bill.status)?);

    let existing_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM bill_movements WHERE bill_id = $1")
        .bind(bill_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_err)?
        .try_get("n")
        .map_err(map_db_err)?;

    let fresh = movements_to_append(&bill.movements, existing_count as usize);
    for (offset, movement) in fresh.iter().enumerate() {
        let order_index = existing_count as i32 + offset as i32;
        let to_status = movement.to_status.as_deref().map(parse_status).transpose()?;
        let from_status = movement.from_status.as_deref().map(parse_status).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO bill_movements (id, bill_id, order_index, description,
                                        from_status, to_status, movement_date, source_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (bill_id, order_index) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bill_id)
        .bind(order_index)
        .bind(&movement.description)
        .bind(from_status.map(|s| s.as_str()))
        .bind(to_status.map(|s| s.as_str()))
        .bind(movement.date)
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;

        if let Some(to) = to_status {
            status = resolve_bill_status(Some(status), to);
        }

        if !is_new {
            outcome.events.push(FeedEvent::BillMovement {
                bill_id,
                bill_external_id: bill.id.clone(),
                bill_title: bill.title.clone(),
                description: movement.description.clone(),
                to_status,
                source_ref_id,
                tags: vec![],
            });
        }
    }

    sqlx::query(
        r#"
        INSERT INTO bills (id, tenant_id, external_id, title, status, bill_type,
                           presented_date, period, source_ref_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (tenant_id, external_id) DO UPDATE SET
               title = EXCLUDED.title,
               status = EXCLUDED.status,
               bill_type = EXCLUDED.bill_type,
               presented_date = EXCLUDED.presented_date,
               period = EXCLUDED.period,
               source_ref_id = EXCLUDED.source_ref_id
        "#,
    )
    .bind(bill_id)
    .bind(tenant_id)
    .bind(&bill.id)
    .bind(&bill.title)
    .bind(status.as_str())
    .bind(&bill.bill_type)
    .bind(bill.presented_date)
    .bind(bill.period)
    .bind(source_ref_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    outcome.processed += 1;

    let mut author_names = Vec::new();
    for author in &bill.authors {
        let Some(legislator_id) =
            legislator_id_by_external(pool, tenant_id, &author.legislator_id).await?
        else {
            // Expected to arrive in a later sync; skip the dependent row.
            outcome.errored += 1;
            continue;
        };
        let role = AuthorRole::parse(&author.role)
            .ok_or_else(|| CoreError::schema(format!("unknown author role {:?}", author.role)))?;

        sqlx::query(
            r#"
            INSERT INTO bill_authors (bill_id, legislator_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (bill_id, legislator_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(bill_id)
        .bind(legislator_id)
        .bind(role.as_str())
        .execute(pool)
        .await
        .map_err(map_db_err)?;

        outcome
            .affected_legislators
            .push((legislator_id, bill.period));

        let name_row = sqlx::query("SELECT first_name, last_name FROM legislators WHERE id = $1")
            .bind(legislator_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_err)?;
        let first: String = name_row.try_get("first_name").map_err(map_db_err)?;
        let last: String = name_row.try_get("last_name").map_err(map_db_err)?;
        author_names.push(format!("{first} {last}"));
    }

    if is_new {
        outcome.events.push(FeedEvent::BillCreated {
            bill_id,
            external_id: bill.id.clone(),
            title: bill.title.clone(),
            authors: author_names,
            source_ref_id,
            tags: vec![],
        });
    }

    Ok(())
}

pub async fn normalize_votes(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = civic::parse_votes(bytes)?;

    for event in &payload.vote_events {
        for vote in &event.votes {
            VoteChoice::parse(&vote.vote)
                .ok_or_else(|| CoreError::schema(format!("unknown vote {:?}", vote.vote)))?;
        }
    }

    let mut outcome = NormalizeOutcome::default();
    for event in &payload.vote_events {
        normalize_one_vote_event(pool, tenant_id, source_ref_id, event, &mut outcome).await?;
    }
    Ok(outcome)
}

async fn normalize_one_vote_event(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    event: &CivicVoteEvent,
    outcome: &mut NormalizeOutcome,
) -> CoreResult<()> {
    let existing = sqlx::query(
        "SELECT id FROM vote_events WHERE tenant_id = $1 AND external_id = $2",
    )
    .bind(tenant_id)
    .bind(&event.id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    let is_new = existing.is_none();
    let vote_event_id = existing
        .map(|row| row.try_get::<Uuid, _>("id").map_err(map_db_err))
        .transpose()?
        .unwrap_or_else(Uuid::new_v4);

    // Tallies are overwritten from the payload; the feed is authoritative.
    sqlx::query(
        r#"
        INSERT INTO vote_events (id, tenant_id, external_id, session_external_id, title,
                                 affirmative, negative, abstentions, absent, result,
                                 vote_date, source_ref_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (tenant_id, external_id) DO UPDATE SET
               title = EXCLUDED.title,
               affirmative = EXCLUDED.affirmative,
               negative = EXCLUDED.negative,
               abstentions = EXCLUDED.abstentions,
               absent = EXCLUDED.absent,
               result = EXCLUDED.result,
               vote_date = EXCLUDED.vote_date,
               source_ref_id = EXCLUDED.source_ref_id
        "#,
    )
    .bind(vote_event_id)
    .bind(tenant_id)
    .bind(&event.id)
    .bind(&event.session_id)
    .bind(&event.title)
    .bind(event.affirmative)
    .bind(event.negative)
    .bind(event.abstentions)
    .bind(event.absent)
    .bind(&event.result)
    .bind(event.date)
    .bind(source_ref_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    outcome.processed += 1;

    let period = event.date.map(|d| d.year()).unwrap_or_else(|| {
        chrono::Utc::now().year()
    });

    for vote in &event.votes {
        let Some(legislator_id) =
            legislator_id_by_external(pool, tenant_id, &vote.legislator_id).await?
        else {
            outcome.errored += 1;
            continue;
        };
        let choice = VoteChoice::parse(&vote.vote).expect("validated above");

        sqlx::query(
            r#"
            INSERT INTO vote_results (vote_event_id, legislator_id, vote)
            VALUES ($1, $2, $3)
            ON CONFLICT (vote_event_id, legislator_id) DO UPDATE SET vote = EXCLUDED.vote
            "#,
        )
        .bind(vote_event_id)
        .bind(legislator_id)
        .bind(choice.as_str())
        .execute(pool)
        .await
        .map_err(map_db_err)?;

        outcome.affected_legislators.push((legislator_id, period));
    }

    if is_new {
        outcome.events.push(FeedEvent::VoteResult {
            vote_event_id,
            title: event.title.clone(),
            affirmative: event.affirmative,
            negative: event.negative,
            abstentions: event.abstentions,
            absent: event.absent,
            source_ref_id,
            tags: vec![],
        });
    }

    Ok(())
}

pub async fn normalize_sessions(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = civic::parse_sessions(bytes)?;

    for session in &payload.sessions {
        parse_chamber(&session.chamber)?;
    }

    let mut outcome = NormalizeOutcome::default();
    for session in &payload.sessions {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, tenant_id, external_id, session_date, chamber, source_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, external_id) DO UPDATE SET
                   session_date = EXCLUDED.session_date,
                   chamber = EXCLUDED.chamber,
                   source_ref_id = EXCLUDED.source_ref_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(&session.id)
        .bind(session.date)
        .bind(parse_chamber(&session.chamber)?.as_str())
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;
    }
    Ok(outcome)
}

pub async fn normalize_attendance(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = civic::parse_attendance(bytes)?;

    for session in &payload.sessions {
        parse_chamber(&session.chamber)?;
        for record in &session.records {
            AttendanceStatus::parse(&record.status).ok_or_else(|| {
                CoreError::schema(format!("unknown attendance status {:?}", record.status))
            })?;
        }
    }

    let mut outcome = NormalizeOutcome::default();
    for session in &payload.sessions {
        normalize_one_session_attendance(pool, tenant_id, source_ref_id, session, &mut outcome)
            .await?;
    }
    Ok(outcome)
}

async fn normalize_one_session_attendance(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    session: &CivicSessionAttendance,
    outcome: &mut NormalizeOutcome,
) -> CoreResult<()> {
    let existing = sqlx::query(
        "SELECT id FROM sessions WHERE tenant_id = $1 AND external_id = $2",
    )
    .bind(tenant_id)
    .bind(&session.session_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    let session_is_new = existing.is_none();
    let session_id = existing
        .map(|row| row.try_get::<Uuid, _>("id").map_err(map_db_err))
        .transpose()?
        .unwrap_or_else(Uuid::new_v4);

    sqlx::query(
        r#"
        INSERT INTO sessions (id, tenant_id, external_id, session_date, chamber, source_ref_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (tenant_id, external_id) DO UPDATE SET
               session_date = EXCLUDED.session_date,
               source_ref_id = EXCLUDED.source_ref_id
        "#,
    )
    .bind(session_id)
    .bind(tenant_id)
    .bind(&session.session_id)
    .bind(session.date)
    .bind(parse_chamber(&session.chamber)?.as_str())
    .bind(source_ref_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;

    let period = session.date.year();
    let mut present = 0i32;
    let mut absent = 0i32;
    let mut total = 0i32;

    for record in &session.records {
        let status = AttendanceStatus::parse(&record.status).expect("validated above");
        total += 1;
        match status {
            AttendanceStatus::Present => present += 1,
            AttendanceStatus::Absent => absent += 1,
            AttendanceStatus::Justified => {}
        }

        let Some(legislator_id) =
            legislator_id_by_external(pool, tenant_id, &record.legislator_id).await?
        else {
            outcome.errored += 1;
            continue;
        };

        sqlx::query(
            r#"
            INSERT INTO attendance (session_id, legislator_id, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id, legislator_id) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(session_id)
        .bind(legislator_id)
        .bind(status.as_str())
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;

        outcome.affected_legislators.push((legislator_id, period));
    }

    if session_is_new {
        outcome.events.push(FeedEvent::AttendanceRecord {
            session_id,
            session_date: session.date,
            present,
            total,
            absent,
            source_ref_id,
            tags: vec![],
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn movement(description: &str, to: Option<&str>, day: u32) -> CivicMovement {
        CivicMovement {
            description: description.to_string(),
            from_status: None,
            to_status: to.map(str::to_string),
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
        }
    }

    #[test]
    fn bill_status_never_regresses() {
        assert_eq!(
            resolve_bill_status(None, BillStatus::Presented),
            BillStatus::Presented
        );
        assert_eq!(
            resolve_bill_status(Some(BillStatus::Presented), BillStatus::InCommittee),
            BillStatus::InCommittee
        );
        // A movement to an earlier status stays in history only.
        assert_eq!(
            resolve_bill_status(Some(BillStatus::FloorVote), BillStatus::InCommittee),
            BillStatus::FloorVote
        );
        assert_eq!(
            resolve_bill_status(Some(BillStatus::InCommittee), BillStatus::Withdrawn),
            BillStatus::Withdrawn
        );
    }

    #[test]
    fn only_the_movement_tail_is_appended() {
        let history = vec![
            movement("Presentado", Some("PRESENTED"), 1),
            movement("A comisión", Some("IN_COMMITTEE"), 10),
            movement("Dictamen", Some("WITH_OPINION"), 20),
        ];
        assert_eq!(movements_to_append(&history, 0).len(), 3);
        assert_eq!(movements_to_append(&history, 2).len(), 1);
        assert_eq!(movements_to_append(&history, 2)[0].description, "Dictamen");
        assert_eq!(movements_to_append(&history, 3).len(), 0);
        assert_eq!(movements_to_append(&history, 5).len(), 0);
    }
}
