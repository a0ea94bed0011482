//! Fetch-audit persistence: the append-only `source_refs` and
//! `ingestion_runs` tables.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_core::model::{DataType, IngestionRun, RunStatus, SourceRef, SourceRefStatus};
use pulso_core::{CoreError, CoreResult};

/// Map a driver error onto the core taxonomy. Unique-key violations are
/// upsert contention; everything else from the pool is transient.
pub fn map_db_err(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::RowNotFound => CoreError::NotFound("row".into()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CoreError::Conflict(db.message().to_string())
        }
        _ => CoreError::transient(err),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedFetch {
    pub source_ref: SourceRef,
    pub is_new: bool,
}

/// `RecordFetch`: atomically check the most recent SourceRef for
/// `(source_key, checksum)`; if the latest fetch carried the same checksum
/// the payload is unchanged and the existing row is returned with
/// `is_new = false`. Otherwise a new append-only row is inserted.
pub async fn record_fetch(
    pool: &PgPool,
    ingestion_run_id: Uuid,
    source_key: &str,
    data_type: DataType,
    checksum: &str,
    blob_location: &str,
    fetched_at: DateTime<Utc>,
) -> CoreResult<RecordedFetch> {
    let mut tx = pool.begin().await.map_err(map_db_err)?;

    let latest = sqlx::query(
        r#"
        SELECT id, ingestion_run_id, source_key, data_type, checksum,
               blob_location, fetched_at, status
          FROM source_refs
         WHERE source_key = $1
         ORDER BY fetched_at DESC, id DESC
         LIMIT 1
         FOR UPDATE
        "#,
    )
    .bind(source_key)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_err)?;

    if let Some(row) = latest {
        let existing = source_ref_from_row(&row)?;
        if existing.checksum == checksum {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(RecordedFetch {
                source_ref: existing,
                is_new: false,
            });
        }
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO source_refs
               (id, ingestion_run_id, source_key, data_type, checksum,
                blob_location, fetched_at, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'ok')
        "#,
    )
    .bind(id)
    .bind(ingestion_run_id)
    .bind(source_key)
    .bind(data_type.as_str())
    .bind(checksum)
    .bind(blob_location)
    .bind(fetched_at)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;

    tx.commit().await.map_err(map_db_err)?;

    Ok(RecordedFetch {
        source_ref: SourceRef {
            id,
            ingestion_run_id,
            source_key: source_key.to_string(),
            data_type,
            checksum: checksum.to_string(),
            blob_location: blob_location.to_string(),
            fetched_at,
            status: SourceRefStatus::Ok,
        },
        is_new: true,
    })
}

/// Checksum of the most recent fetch for a source key, if any. Lets the
/// ingest worker skip the blob write for an unchanged payload before the
/// atomic `record_fetch` check.
pub async fn latest_checksum(pool: &PgPool, source_key: &str) -> CoreResult<Option<String>> {
    let row = sqlx::query(
        r#"
        SELECT checksum
          FROM source_refs
         WHERE source_key = $1
         ORDER BY fetched_at DESC, id DESC
         LIMIT 1
        "#,
    )
    .bind(source_key)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.map(|r| r.try_get("checksum").map_err(map_db_err))
        .transpose()
}

pub async fn get_source_ref(pool: &PgPool, id: Uuid) -> CoreResult<SourceRef> {
    let row = sqlx::query(
        r#"
        SELECT id, ingestion_run_id, source_key, data_type, checksum,
               blob_location, fetched_at, status
          FROM source_refs
         WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("source_ref {id}")))?;
    source_ref_from_row(&row)
}

/// Structural parse failure downstream marks the ref, never the bytes.
pub async fn mark_source_ref_error(pool: &PgPool, id: Uuid) -> CoreResult<()> {
    sqlx::query("UPDATE source_refs SET status = 'error' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

pub async fn start_run(
    pool: &PgPool,
    source_name: &str,
    data_type: DataType,
) -> CoreResult<IngestionRun> {
    let id = Uuid::new_v4();
    let started_at = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO ingestion_runs (id, source_name, data_type, started_at, status,
                                    records_processed, records_skipped, records_errored)
        VALUES ($1, $2, $3, $4, 'running', 0, 0, 0)
        "#,
    )
    .bind(id)
    .bind(source_name)
    .bind(data_type.as_str())
    .bind(started_at)
    .execute(pool)
    .await
    .map_err(map_db_err)?;

    Ok(IngestionRun {
        id,
        source_name: source_name.to_string(),
        data_type,
        started_at,
        completed_at: None,
        status: RunStatus::Running,
        records_processed: 0,
        records_skipped: 0,
        records_errored: 0,
        error_detail: None,
    })
}

pub async fn complete_run(
    pool: &PgPool,
    run_id: Uuid,
    processed: i32,
    skipped: i32,
    errored: i32,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE ingestion_runs
           SET status = 'completed',
               completed_at = NOW(),
               records_processed = $2,
               records_skipped = $3,
               records_errored = $4
         WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(processed)
    .bind(skipped)
    .bind(errored)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

pub async fn fail_run(
    pool: &PgPool,
    run_id: Uuid,
    error_detail: serde_json::Value,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE ingestion_runs
           SET status = 'failed',
               completed_at = NOW(),
               error_detail = $2
         WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(error_detail)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

pub async fn add_run_errors(pool: &PgPool, run_id: Uuid, errors: i32) -> CoreResult<()> {
    sqlx::query(
        "UPDATE ingestion_runs SET records_errored = records_errored + $2 WHERE id = $1",
    )
    .bind(run_id)
    .bind(errors)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

pub fn source_ref_from_row(row: &PgRow) -> CoreResult<SourceRef> {
    let data_type_raw: String = row.try_get("data_type").map_err(map_db_err)?;
    let status_raw: String = row.try_get("status").map_err(map_db_err)?;
    Ok(SourceRef {
        id: row.try_get("id").map_err(map_db_err)?,
        ingestion_run_id: row.try_get("ingestion_run_id").map_err(map_db_err)?,
        source_key: row.try_get("source_key").map_err(map_db_err)?,
        data_type: DataType::parse(&data_type_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown data_type {data_type_raw}")))?,
        checksum: row.try_get("checksum").map_err(map_db_err)?,
        blob_location: row.try_get("blob_location").map_err(map_db_err)?,
        fetched_at: row.try_get("fetched_at").map_err(map_db_err)?,
        status: if status_raw == "error" {
            SourceRefStatus::Error
        } else {
            SourceRefStatus::Ok
        },
    })
}

pub fn run_from_row(row: &PgRow) -> CoreResult<IngestionRun> {
    let data_type_raw: String = row.try_get("data_type").map_err(map_db_err)?;
    let status_raw: String = row.try_get("status").map_err(map_db_err)?;
    Ok(IngestionRun {
        id: row.try_get("id").map_err(map_db_err)?,
        source_name: row.try_get("source_name").map_err(map_db_err)?,
        data_type: DataType::parse(&data_type_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown data_type {data_type_raw}")))?,
        started_at: row.try_get("started_at").map_err(map_db_err)?,
        completed_at: row.try_get("completed_at").map_err(map_db_err)?,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown run status {status_raw}")))?,
        records_processed: row.try_get("records_processed").map_err(map_db_err)?,
        records_skipped: row.try_get("records_skipped").map_err(map_db_err)?,
        records_errored: row.try_get("records_errored").map_err(map_db_err)?,
        error_detail: row.try_get("error_detail").map_err(map_db_err)?,
    })
}
