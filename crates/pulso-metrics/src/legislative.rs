//! Legislator metrics: one row per `(legislator, period)`, recomputed from
//! scratch on every trigger and upserted last-writer-wins.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_core::model::LegislatorMetric;
use pulso_core::{CoreError, CoreResult};
use pulso_storage::map_db_err;

use crate::{round4, safe_rate};

/// Everything the formulas consume, gathered in one pass so the
/// computation itself is pure and testable.
#[derive(Debug, Clone, Default)]
pub struct MetricInputs {
    pub bills_authored: i64,
    pub bills_cosigned: i64,
    pub bills_with_advancement: i64,
    pub attendance_total: i64,
    pub attendance_present: i64,
    pub votes_total: i64,
    pub votes_cast: i64,
    pub commissions_count: i64,
    pub term_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricValues {
    pub bills_authored: i32,
    pub bills_cosigned: i32,
    pub bills_with_advancement: i32,
    pub advancement_rate: f64,
    pub attendance_rate: f64,
    pub vote_participation_rate: f64,
    pub commissions_count: i32,
    pub months_in_office: i32,
    pub normalised_productivity: f64,
}

/// Whole months elapsed from `term_start` to `now`, floored at 1.
pub fn months_in_office(term_start: Option<NaiveDate>, now: DateTime<Utc>) -> i32 {
    let Some(start) = term_start else { return 1 };
    let months = (now.year() - start.year()) * 12 + (now.month() as i32 - start.month() as i32);
    months.max(1)
}

pub fn compute(inputs: &MetricInputs, now: DateTime<Utc>) -> MetricValues {
    let months = months_in_office(inputs.term_start, now);
    MetricValues {
        bills_authored: inputs.bills_authored as i32,
        bills_cosigned: inputs.bills_cosigned as i32,
        bills_with_advancement: inputs.bills_with_advancement as i32,
        advancement_rate: safe_rate(inputs.bills_with_advancement, inputs.bills_authored),
        attendance_rate: safe_rate(inputs.attendance_present, inputs.attendance_total),
        vote_participation_rate: safe_rate(inputs.votes_cast, inputs.votes_total),
        commissions_count: inputs.commissions_count as i32,
        months_in_office: months,
        normalised_productivity: round4(inputs.bills_authored as f64 / months as f64),
    }
}

pub async fn gather_inputs(
    pool: &PgPool,
    legislator_id: Uuid,
    period: i32,
) -> CoreResult<MetricInputs> {
    let authorship = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE ba.role = 'AUTHOR') AS authored,
            COUNT(*) FILTER (WHERE ba.role = 'COAUTHOR') AS cosigned,
            COUNT(*) FILTER (WHERE ba.role = 'AUTHOR' AND b.status <> 'PRESENTED') AS advanced
          FROM bill_authors ba
          JOIN bills b ON b.id = ba.bill_id
         WHERE ba.legislator_id = $1 AND b.period = $2
        "#,
    )
    .bind(legislator_id)
    .bind(period)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;

    let attendance = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE a.status = 'PRESENT') AS present
          FROM attendance a
          JOIN sessions s ON s.id = a.session_id
         WHERE a.legislator_id = $1
           AND EXTRACT(YEAR FROM s.session_date)::int = $2
        "#,
    )
    .bind(legislator_id)
    .bind(period)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;

    let votes = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE vr.vote <> 'ABSENT') AS cast
          FROM vote_results vr
          JOIN vote_events ve ON ve.id = vr.vote_event_id
         WHERE vr.legislator_id = $1
           AND (ve.vote_date IS NULL OR EXTRACT(YEAR FROM ve.vote_date)::int = $2)
        "#,
    )
    .bind(legislator_id)
    .bind(period)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;

    let commissions = sqlx::query(
        "SELECT COUNT(*) AS n FROM commission_memberships WHERE legislator_id = $1",
    )
    .bind(legislator_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;

    let term_start = sqlx::query("SELECT term_start FROM legislators WHERE id = $1")
        .bind(legislator_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| CoreError::NotFound(format!("legislator {legislator_id}")))?
        .try_get::<Option<NaiveDate>, _>("term_start")
        .map_err(map_db_err)?;

    Ok(MetricInputs {
        bills_authored: authorship.try_get("authored").map_err(map_db_err)?,
        bills_cosigned: authorship.try_get("cosigned").map_err(map_db_err)?,
        bills_with_advancement: authorship.try_get("advanced").map_err(map_db_err)?,
        attendance_total: attendance.try_get("total").map_err(map_db_err)?,
        attendance_present: attendance.try_get("present").map_err(map_db_err)?,
        votes_total: votes.try_get("total").map_err(map_db_err)?,
        votes_cast: votes.try_get("cast").map_err(map_db_err)?,
        commissions_count: commissions.try_get("n").map_err(map_db_err)?,
        term_start,
    })
}

/// Recompute and upsert one `(legislator, period)` row. Idempotent:
/// running it twice writes the same scalars.
pub async fn recompute(
    pool: &PgPool,
    legislator_id: Uuid,
    period: i32,
) -> CoreResult<LegislatorMetric> {
    let inputs = gather_inputs(pool, legislator_id, period).await?;
    let now = Utc::now();
    let values = compute(&inputs, now);

    sqlx::query(
        r#"
        INSERT INTO legislator_metrics
               (legislator_id, period, bills_authored, bills_cosigned,
                bills_with_advancement, advancement_rate, attendance_rate,
                vote_participation_rate, commissions_count, months_in_office,
                normalised_productivity, computed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (legislator_id, period) DO UPDATE SET
                bills_authored = EXCLUDED.bills_authored,
                bills_cosigned = EXCLUDED.bills_cosigned,
                bills_with_advancement = EXCLUDED.bills_with_advancement,
                advancement_rate = EXCLUDED.advancement_rate,
                attendance_rate = EXCLUDED.attendance_rate,
                vote_participation_rate = EXCLUDED.vote_participation_rate,
                commissions_count = EXCLUDED.commissions_count,
                months_in_office = EXCLUDED.months_in_office,
                normalised_productivity = EXCLUDED.normalised_productivity,
                computed_at = EXCLUDED.computed_at
        "#,
    )
    .bind(legislator_id)
    .bind(period)
    .bind(values.bills_authored)
    .bind(values.bills_cosigned)
    .bind(values.bills_with_advancement)
    .bind(values.advancement_rate)
    .bind(values.attendance_rate)
    .bind(values.vote_participation_rate)
    .bind(values.commissions_count)
    .bind(values.months_in_office)
    .bind(values.normalised_productivity)
    .bind(now)
    .execute(pool)
    .await
    .map_err(map_db_err)?;

    Ok(LegislatorMetric {
        legislator_id,
        period,
        bills_authored: values.bills_authored,
        bills_cosigned: values.bills_cosigned,
        bills_with_advancement: values.bills_with_advancement,
        advancement_rate: values.advancement_rate,
        attendance_rate: values.attendance_rate,
        vote_participation_rate: values.vote_participation_rate,
        commissions_count: values.commissions_count,
        months_in_office: values.months_in_office,
        normalised_productivity: values.normalised_productivity,
        computed_at: now,
    })
}

/// Periods with at least one contributing raw entity for this legislator.
/// A derived row exists only for these.
pub async fn contributing_periods(pool: &PgPool, legislator_id: Uuid) -> CoreResult<Vec<i32>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT period FROM (
            SELECT b.period
              FROM bill_authors ba JOIN bills b ON b.id = ba.bill_id
             WHERE ba.legislator_id = $1
            UNION
            SELECT EXTRACT(YEAR FROM s.session_date)::int
              FROM attendance a JOIN sessions s ON s.id = a.session_id
             WHERE a.legislator_id = $1
            UNION
            SELECT EXTRACT(YEAR FROM ve.vote_date)::int
              FROM vote_results vr JOIN vote_events ve ON ve.id = vr.vote_event_id
             WHERE vr.legislator_id = $1 AND ve.vote_date IS NOT NULL
        ) periods
        ORDER BY period
        "#,
    )
    .bind(legislator_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;

    rows.iter()
        .map(|row| row.try_get::<i32, _>("period").map_err(map_db_err))
        .collect()
}

/// Nightly full recompute: every legislator, every contributing period.
pub async fn recompute_all(pool: &PgPool) -> CoreResult<usize> {
    let rows = sqlx::query("SELECT id FROM legislators")
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;

    let mut recomputed = 0usize;
    for row in rows {
        let legislator_id: Uuid = row.try_get("id").map_err(map_db_err)?;
        for period in contributing_periods(pool, legislator_id).await? {
            recompute(pool, legislator_id, period).await?;
            recomputed += 1;
        }
    }
    Ok(recomputed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn rates_follow_the_formulas() {
        let inputs = MetricInputs {
            bills_authored: 8,
            bills_cosigned: 3,
            bills_with_advancement: 2,
            attendance_total: 10,
            attendance_present: 9,
            votes_total: 20,
            votes_cast: 18,
            commissions_count: 4,
            term_start: NaiveDate::from_ymd_opt(2023, 12, 10),
        };
        let values = compute(&inputs, at(2026, 6));
        assert_eq!(values.advancement_rate, 0.25);
        assert_eq!(values.attendance_rate, 0.9);
        assert_eq!(values.vote_participation_rate, 0.9);
        assert_eq!(values.months_in_office, 30);
        assert_eq!(values.normalised_productivity, round4(8.0 / 30.0));
    }

    #[test]
    fn zero_denominators_yield_zero_rates() {
        let values = compute(&MetricInputs::default(), at(2026, 1));
        assert_eq!(values.advancement_rate, 0.0);
        assert_eq!(values.attendance_rate, 0.0);
        assert_eq!(values.vote_participation_rate, 0.0);
    }

    #[test]
    fn rates_stay_in_unit_interval() {
        let inputs = MetricInputs {
            bills_authored: 2,
            bills_with_advancement: 2,
            attendance_total: 5,
            attendance_present: 5,
            votes_total: 7,
            votes_cast: 7,
            ..Default::default()
        };
        let values = compute(&inputs, at(2026, 1));
        for rate in [
            values.advancement_rate,
            values.attendance_rate,
            values.vote_participation_rate,
        ] {
            assert!((0.0..=1.0).contains(&rate));
        }
    }

    #[test]
    fn months_in_office_floors_at_one() {
        assert_eq!(months_in_office(None, at(2026, 1)), 1);
        assert_eq!(
            months_in_office(NaiveDate::from_ymd_opt(2026, 1, 2), at(2026, 1)),
            1
        );
        assert_eq!(
            months_in_office(NaiveDate::from_ymd_opt(2025, 11, 1), at(2026, 1)),
            2
        );
    }

    #[test]
    fn recompute_is_idempotent_over_values() {
        let inputs = MetricInputs {
            bills_authored: 5,
            bills_with_advancement: 1,
            attendance_total: 4,
            attendance_present: 3,
            votes_total: 6,
            votes_cast: 5,
            term_start: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..Default::default()
        };
        let now = at(2026, 3);
        assert_eq!(compute(&inputs, now), compute(&inputs, now));
    }
}
