//! Durable named job queues on Postgres.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED`, retried with exponential
//! backoff until their attempt budget is exhausted, then parked in the
//! dead-letter state for manual inspection. Handlers must be idempotent:
//! the upsert keys in the relational model make a re-delivered job a no-op.

pub mod scheduler;
pub mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use pulso_core::{CoreError, CoreResult};
use pulso_storage::map_db_err;

pub const CRATE_NAME: &str = "pulso-queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Ingest,
    Normalize,
    Metrics,
    Feed,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ingest => "ingest",
            QueueName::Normalize => "normalize",
            QueueName::Metrics => "metrics",
            QueueName::Feed => "feed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ingest" => Some(QueueName::Ingest),
            "normalize" => Some(QueueName::Normalize),
            "metrics" => Some(QueueName::Metrics),
            "feed" => Some(QueueName::Feed),
            _ => None,
        }
    }

    pub fn all() -> [QueueName; 4] {
        [
            QueueName::Ingest,
            QueueName::Normalize,
            QueueName::Metrics,
            QueueName::Feed,
        ]
    }

    /// Per-job soft deadline. Expiry causes cooperative stop and retry;
    /// there is no hard kill.
    pub fn soft_deadline(&self) -> Duration {
        match self {
            QueueName::Ingest => Duration::from_secs(5 * 60),
            QueueName::Normalize => Duration::from_secs(30),
            QueueName::Metrics => Duration::from_secs(60),
            QueueName::Feed => Duration::from_secs(30),
        }
    }

    pub fn default_concurrency(&self) -> usize {
        match self {
            QueueName::Ingest => 4,
            QueueName::Normalize => 4,
            QueueName::Metrics => 2,
            QueueName::Feed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub attempts: i32,
    pub backoff_seed: Duration,
    pub remove_on_complete: i64,
    pub remove_on_fail: i64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_seed: Duration::from_secs(45),
            remove_on_complete: 100,
            remove_on_fail: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub queue: QueueName,
    pub name: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_seed_secs: i64,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Delay before retry `attempt` (1-based): `seed * 2^(attempt-1)`.
pub fn backoff_delay(seed: Duration, attempt: i32) -> Duration {
    let shift = attempt.saturating_sub(1).clamp(0, 16) as u32;
    let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
    seed.saturating_mul(factor)
}

/// Retry budget for a failure kind: transient errors use the configured
/// attempt budget; upsert contention gets exactly one retry; everything
/// else goes straight to the dead-letter state.
pub fn effective_attempts(err: &CoreError, configured: i32) -> i32 {
    match err {
        CoreError::TransientIo(_) => configured,
        CoreError::Conflict(_) => 2.min(configured),
        _ => 1,
    }
}

/// Startup check: the scheduler and workers refuse to run without a
/// reachable queue store.
pub async fn verify_connectivity(pool: &PgPool) -> CoreResult<()> {
    sqlx::query("SELECT 1 FROM jobs LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|err| CoreError::Config(format!("queue store unreachable: {err}")))?;
    Ok(())
}

pub async fn enqueue(
    pool: &PgPool,
    queue: QueueName,
    name: &str,
    payload: Value,
    opts: JobOptions,
) -> CoreResult<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO jobs (queue, name, payload, status, attempts_made, max_attempts,
                          backoff_seed_secs, run_at, created_at)
        VALUES ($1, $2, $3, 'queued', 0, $4, $5, NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(queue.as_str())
    .bind(name)
    .bind(payload)
    .bind(opts.attempts)
    .bind(opts.backoff_seed.as_secs() as i64)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;
    row.try_get("id").map_err(map_db_err)
}

/// Enqueue unless an identical `(queue, name)` job is already waiting.
/// Scheduler fires use this so missed or overlapping fires collapse to a
/// single run.
pub async fn enqueue_unique(
    pool: &PgPool,
    queue: QueueName,
    name: &str,
    payload: Value,
    opts: JobOptions,
) -> CoreResult<Option<i64>> {
    let existing = sqlx::query(
        "SELECT id FROM jobs WHERE queue = $1 AND name = $2 AND status = 'queued' LIMIT 1",
    )
    .bind(queue.as_str())
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;

    if existing.is_some() {
        return Ok(None);
    }
    enqueue(pool, queue, name, payload, opts).await.map(Some)
}

/// Claim the oldest runnable job in FIFO order. `SKIP LOCKED` keeps
/// concurrent workers from contending on the same row.
pub async fn claim_next(pool: &PgPool, queue: QueueName) -> CoreResult<Option<Job>> {
    let row = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'running', locked_at = NOW()
         WHERE id = (
               SELECT id
                 FROM jobs
                WHERE queue = $1 AND status = 'queued' AND run_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
         )
        RETURNING id, queue, name, payload, status, attempts_made, max_attempts,
                  backoff_seed_secs, run_at, created_at, last_error
        "#,
    )
    .bind(queue.as_str())
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;

    row.map(|r| job_from_row(&r)).transpose()
}

pub async fn complete_job(pool: &PgPool, job: &Job, result: Value) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'completed', completed_at = NOW(), result = $2
         WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(result)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    prune(pool, job.queue, JobOptions::default()).await
}

/// Record a failure: reschedule with backoff while the attempt budget for
/// this error kind lasts, otherwise park in the dead-letter state.
pub async fn fail_job(pool: &PgPool, job: &Job, err: &CoreError) -> CoreResult<()> {
    let attempts_made = job.attempts_made + 1;
    let budget = effective_attempts(err, job.max_attempts);

    if attempts_made >= budget {
        sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'dead', attempts_made = $2, completed_at = NOW(),
                   last_error = $3
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(attempts_made)
        .bind(err.to_string())
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        return prune(pool, job.queue, JobOptions::default()).await;
    }

    let delay = backoff_delay(Duration::from_secs(job.backoff_seed_secs as u64), attempts_made);
    sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'queued', attempts_made = $2,
               run_at = NOW() + make_interval(secs => $3),
               last_error = $4, locked_at = NULL
         WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(attempts_made)
    .bind(delay.as_secs() as f64)
    .bind(err.to_string())
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

/// Retention: keep the newest `remove_on_complete` completed and
/// `remove_on_fail` dead rows per queue.
pub async fn prune(pool: &PgPool, queue: QueueName, opts: JobOptions) -> CoreResult<()> {
    for (status, keep) in [
        ("completed", opts.remove_on_complete),
        ("dead", opts.remove_on_fail),
    ] {
        sqlx::query(
            r#"
            DELETE FROM jobs
             WHERE queue = $1 AND status = $2
               AND id NOT IN (
                   SELECT id FROM jobs
                    WHERE queue = $1 AND status = $2
                    ORDER BY id DESC
                    LIMIT $3
               )
            "#,
        )
        .bind(queue.as_str())
        .bind(status)
        .bind(keep)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    }
    Ok(())
}

fn job_from_row(row: &PgRow) -> CoreResult<Job> {
    let queue_raw: String = row.try_get("queue").map_err(map_db_err)?;
    let status_raw: String = row.try_get("status").map_err(map_db_err)?;
    Ok(Job {
        id: row.try_get("id").map_err(map_db_err)?,
        queue: QueueName::parse(&queue_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown queue {queue_raw}")))?,
        name: row.try_get("name").map_err(map_db_err)?,
        payload: row.try_get("payload").map_err(map_db_err)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown job status {status_raw}")))?,
        attempts_made: row.try_get("attempts_made").map_err(map_db_err)?,
        max_attempts: row.try_get("max_attempts").map_err(map_db_err)?,
        backoff_seed_secs: row.try_get("backoff_seed_secs").map_err(map_db_err)?,
        run_at: row.try_get("run_at").map_err(map_db_err)?,
        created_at: row.try_get("created_at").map_err(map_db_err)?,
        last_error: row.try_get("last_error").map_err(map_db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let seed = Duration::from_secs(45);
        assert_eq!(backoff_delay(seed, 1), Duration::from_secs(45));
        assert_eq!(backoff_delay(seed, 2), Duration::from_secs(90));
        assert_eq!(backoff_delay(seed, 3), Duration::from_secs(180));
    }

    #[test]
    fn attempt_budget_follows_error_kind() {
        assert_eq!(
            effective_attempts(&CoreError::TransientIo("net".into()), 3),
            3
        );
        assert_eq!(effective_attempts(&CoreError::Conflict("dup".into()), 3), 2);
        assert_eq!(
            effective_attempts(&CoreError::SourceSchema("bad".into()), 3),
            1
        );
        assert_eq!(effective_attempts(&CoreError::Auth("sig".into()), 3), 1);
    }

    #[test]
    fn queue_names_round_trip() {
        for q in QueueName::all() {
            assert_eq!(QueueName::parse(q.as_str()), Some(q));
        }
        assert_eq!(QueueName::parse("unknown"), None);
    }

    #[test]
    fn soft_deadlines_match_queue_class() {
        assert_eq!(QueueName::Ingest.soft_deadline(), Duration::from_secs(300));
        assert_eq!(
            QueueName::Normalize.soft_deadline(),
            Duration::from_secs(30)
        );
        assert_eq!(QueueName::Metrics.soft_deadline(), Duration::from_secs(60));
    }
}
