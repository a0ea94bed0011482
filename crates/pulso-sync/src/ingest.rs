//! Ingest stage: drive one adapter fetch, dedup by checksum against the
//! latest source ref, persist the verbatim blob, and hand the new ref to
//! the normalize queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use pulso_adapters::{adapter_for_source, ConnectionAuth, FetchContext};
use pulso_core::model::{DataType, SourceRef, SyncStatus, PUBLIC_TENANT_ID};
use pulso_core::{CoreError, CoreResult};
use pulso_queue::worker::{JobHandler, JobOutcome};
use pulso_queue::{enqueue, Job, JobOptions, QueueName};
use pulso_storage::db as audit;
use pulso_storage::{sha256_hex, BlobStore as _};

use crate::normalize::NormalizeJobPayload;
use crate::repo;
use crate::PipelineCtx;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJobPayload {
    pub source: String,
    pub data_type: DataType,
    pub tenant_id: Uuid,
    pub connection_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum FetchResult {
    /// Payload checksum matched the latest source ref; run completed with
    /// `records_skipped = 1` and nothing downstream.
    Unchanged,
    /// New payload persisted; the owning run stays `running` until the
    /// normalize step completes it.
    New(SourceRef),
}

/// One adapter invocation: start the audit run, fetch, dedup, store.
pub async fn fetch_and_record(
    ctx: &PipelineCtx,
    source: &str,
    data_type: DataType,
    auth: Option<&ConnectionAuth>,
) -> CoreResult<FetchResult> {
    let adapter = adapter_for_source(source, &ctx.config)
        .ok_or_else(|| CoreError::Config(format!("no adapter registered for source {source}")))?;

    let source_name = match auth {
        Some(auth) => format!("{source}:{}", auth.shop_domain),
        None => source.to_string(),
    };
    let run = audit::start_run(&ctx.db, &source_name, data_type).await?;

    let fetch_ctx = FetchContext {
        run_id: run.id,
        http: &ctx.http,
        auth,
    };

    let payload = match adapter.fetch(&fetch_ctx, data_type).await {
        Ok(payload) => payload,
        Err(err) => {
            let err: CoreError = err.into();
            audit::fail_run(
                &ctx.db,
                run.id,
                json!({ "error": err.to_string(), "kind": err.code() }),
            )
            .await?;
            return Err(err);
        }
    };

    let checksum = sha256_hex(&payload.body);

    if audit::latest_checksum(&ctx.db, &payload.source_key).await?.as_deref()
        == Some(checksum.as_str())
    {
        audit::complete_run(&ctx.db, run.id, 0, 1, 0).await?;
        info!(source_key = %payload.source_key, "payload unchanged; skipped");
        return Ok(FetchResult::Unchanged);
    }

    let blob_location = ctx
        .blob
        .put(data_type, payload.fetched_at, &payload.body)
        .await?;

    let recorded = audit::record_fetch(
        &ctx.db,
        run.id,
        &payload.source_key,
        data_type,
        &checksum,
        &blob_location,
        payload.fetched_at,
    )
    .await?;

    if !recorded.is_new {
        // Lost a race with a concurrent fetch of the same bytes.
        audit::complete_run(&ctx.db, run.id, 0, 1, 0).await?;
        return Ok(FetchResult::Unchanged);
    }

    Ok(FetchResult::New(recorded.source_ref))
}

/// Fan-out handler for the scheduled `ingest:all` fire: one fetch job per
/// connection per commerce data type, plus the public civic datasets.
pub struct IngestAllHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for IngestAllHandler {
    async fn handle(&self, _job: &Job) -> CoreResult<JobOutcome> {
        let mut enqueued = 0usize;

        for connection in repo::all_connections(&self.ctx.db).await? {
            for data_type in DataType::commerce_types() {
                let payload = IngestJobPayload {
                    source: "shopify".to_string(),
                    data_type,
                    tenant_id: connection.tenant_id,
                    connection_id: Some(connection.id),
                };
                enqueue(
                    &self.ctx.queue,
                    QueueName::Ingest,
                    "ingest:fetch",
                    serde_json::to_value(&payload).map_err(CoreError::schema)?,
                    JobOptions::default(),
                )
                .await?;
                enqueued += 1;
            }
        }

        for data_type in DataType::civic_types() {
            let payload = IngestJobPayload {
                source: "civic".to_string(),
                data_type,
                tenant_id: PUBLIC_TENANT_ID,
                connection_id: None,
            };
            enqueue(
                &self.ctx.queue,
                QueueName::Ingest,
                "ingest:fetch",
                serde_json::to_value(&payload).map_err(CoreError::schema)?,
                JobOptions::default(),
            )
            .await?;
            enqueued += 1;
        }

        info!(enqueued, "ingest fan-out complete");
        Ok(JobOutcome::Completed)
    }
}

pub struct IngestFetchHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for IngestFetchHandler {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome> {
        let payload: IngestJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(CoreError::schema)?;

        let auth = match payload.connection_id {
            Some(connection_id) => {
                let connection = repo::connection_by_id(&self.ctx.db, connection_id).await?;
                Some(ConnectionAuth {
                    shop_domain: connection.shop_domain,
                    access_token: connection.access_token,
                })
            }
            None => None,
        };

        let result =
            fetch_and_record(&self.ctx, &payload.source, payload.data_type, auth.as_ref()).await;

        match result {
            Ok(FetchResult::Unchanged) => Ok(JobOutcome::Skipped),
            Ok(FetchResult::New(source_ref)) => {
                let normalize_payload = NormalizeJobPayload {
                    source_ref_id: source_ref.id,
                    tenant_id: payload.tenant_id,
                };
                enqueue(
                    &self.ctx.queue,
                    QueueName::Normalize,
                    "normalize:source-ref",
                    serde_json::to_value(&normalize_payload).map_err(CoreError::schema)?,
                    JobOptions::default(),
                )
                .await?;
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                // An auth failure poisons the connection until re-auth.
                if matches!(err, CoreError::Auth(_)) {
                    if let Some(connection_id) = payload.connection_id {
                        warn!(%connection_id, "source rejected credentials; marking connection");
                        repo::set_sync_status(&self.ctx.db, connection_id, SyncStatus::Error)
                            .await?;
                    }
                }
                Err(err)
            }
        }
    }
}
