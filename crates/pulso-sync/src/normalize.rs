//! Normalize stage: load a source ref's verbatim bytes, parse them as the
//! declared schema, upsert, and fan the detected changes out to the
//! metrics and feed queues.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use pulso_core::feed::FeedEvent;
use pulso_core::model::DataType;
use pulso_core::{CoreError, CoreResult};
use pulso_queue::worker::{JobHandler, JobOutcome};
use pulso_queue::{enqueue, Job, JobOptions, QueueName};
use pulso_storage::db as audit;
use pulso_storage::BlobStore as _;

use crate::{civic, commerce, PipelineCtx};

/// What one normalize batch did: counters for the ingestion run plus the
/// change fan-out.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub processed: i32,
    pub skipped: i32,
    pub errored: i32,
    /// `(legislator, period)` pairs whose metric rows must recompute.
    pub affected_legislators: Vec<(Uuid, i32)>,
    /// Tenants whose analysis must recompute.
    pub affected_tenants: Vec<Uuid>,
    pub events: Vec<FeedEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeJobPayload {
    pub source_ref_id: Uuid,
    pub tenant_id: Uuid,
}

/// Parse and upsert one source ref. Completes the owning ingestion run on
/// success; a schema mismatch marks the ref `error`, fails the run and
/// performs no partial upsert.
pub async fn normalize_source_ref(
    ctx: &PipelineCtx,
    source_ref_id: Uuid,
    tenant_id: Uuid,
) -> CoreResult<NormalizeOutcome> {
    let source_ref = audit::get_source_ref(&ctx.db, source_ref_id).await?;
    let bytes = ctx.blob.get(&source_ref.blob_location).await?;

    let result = match source_ref.data_type {
        DataType::Products => {
            commerce::normalize_products(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
        DataType::Orders => {
            commerce::normalize_orders(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
        DataType::Inventory => {
            commerce::normalize_inventory(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
        DataType::Legislators => {
            civic::normalize_legislators(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
        DataType::Bills => civic::normalize_bills(&ctx.db, tenant_id, source_ref_id, &bytes).await,
        DataType::Votes => civic::normalize_votes(&ctx.db, tenant_id, source_ref_id, &bytes).await,
        DataType::Attendance => {
            civic::normalize_attendance(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
        DataType::Sessions => {
            civic::normalize_sessions(&ctx.db, tenant_id, source_ref_id, &bytes).await
        }
    };

    match result {
        Ok(outcome) => {
            audit::complete_run(
                &ctx.db,
                source_ref.ingestion_run_id,
                outcome.processed,
                outcome.skipped,
                outcome.errored,
            )
            .await?;
            info!(
                source_ref = %source_ref_id,
                data_type = source_ref.data_type.as_str(),
                processed = outcome.processed,
                errored = outcome.errored,
                "normalized"
            );
            Ok(outcome)
        }
        Err(err @ CoreError::SourceSchema(_)) => {
            audit::mark_source_ref_error(&ctx.db, source_ref_id).await?;
            audit::fail_run(
                &ctx.db,
                source_ref.ingestion_run_id,
                json!({ "error": err.to_string(), "kind": err.code() }),
            )
            .await?;
            Err(err)
        }
        // Transient failures leave the run open for the retried job.
        Err(err) => Err(err),
    }
}

/// Queue the recompute and feed jobs for one batch, deduplicated.
pub async fn enqueue_followups(ctx: &PipelineCtx, outcome: &NormalizeOutcome) -> CoreResult<()> {
    let mut seen = HashSet::new();
    for (legislator_id, period) in &outcome.affected_legislators {
        if seen.insert((*legislator_id, *period)) {
            enqueue(
                &ctx.queue,
                QueueName::Metrics,
                "metrics:legislator",
                json!({ "legislator_id": legislator_id, "period": period }),
                JobOptions::default(),
            )
            .await?;
        }
    }

    let mut seen_tenants = HashSet::new();
    for tenant_id in &outcome.affected_tenants {
        if seen_tenants.insert(*tenant_id) {
            enqueue(
                &ctx.queue,
                QueueName::Metrics,
                "analysis:tenant",
                json!({ "tenant_id": tenant_id }),
                JobOptions::default(),
            )
            .await?;
        }
    }

    for event in &outcome.events {
        enqueue(
            &ctx.queue,
            QueueName::Feed,
            "feed:emit",
            json!({ "event": event }),
            JobOptions::default(),
        )
        .await?;
    }
    Ok(())
}

pub struct NormalizeHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for NormalizeHandler {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome> {
        let payload: NormalizeJobPayload =
            serde_json::from_value(job.payload.clone()).map_err(CoreError::schema)?;
        let outcome =
            normalize_source_ref(&self.ctx, payload.source_ref_id, payload.tenant_id).await?;
        enqueue_followups(&self.ctx, &outcome).await?;
        Ok(JobOutcome::Completed)
    }
}
