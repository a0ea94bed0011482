//! Derived-state job handlers bridging the queue to the metrics engine.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use pulso_core::feed::FeedEvent;
use pulso_core::{CoreError, CoreResult};
use pulso_metrics::analysis::{self, UserCosts};
use pulso_metrics::legislative;
use pulso_queue::worker::{JobHandler, JobOutcome};
use pulso_queue::{enqueue, Job, JobOptions, QueueName};

use crate::PipelineCtx;

#[derive(Debug, Deserialize)]
struct LegislatorMetricPayload {
    legislator_id: Uuid,
    period: i32,
}

pub struct MetricsLegislatorHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for MetricsLegislatorHandler {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome> {
        let payload: LegislatorMetricPayload =
            serde_json::from_value(job.payload.clone()).map_err(CoreError::schema)?;
        legislative::recompute(&self.ctx.db, payload.legislator_id, payload.period).await?;
        Ok(JobOutcome::Completed)
    }
}

pub struct MetricsRecomputeAllHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for MetricsRecomputeAllHandler {
    async fn handle(&self, _job: &Job) -> CoreResult<JobOutcome> {
        let recomputed = legislative::recompute_all(&self.ctx.db).await?;
        info!(recomputed, "nightly metric recompute finished");
        Ok(JobOutcome::Completed)
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisTenantPayload {
    tenant_id: Uuid,
}

/// Recompute the analysis bundle for one tenant from its current raw
/// state. Queue-triggered runs use no tenant cost overrides; those arrive
/// only through the synchronous analyze endpoint.
pub struct AnalysisTenantHandler {
    pub ctx: std::sync::Arc<PipelineCtx>,
}

#[async_trait]
impl JobHandler for AnalysisTenantHandler {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome> {
        let payload: AnalysisTenantPayload =
            serde_json::from_value(job.payload.clone()).map_err(CoreError::schema)?;

        let inputs =
            analysis::gather_inputs(&self.ctx.db, payload.tenant_id, UserCosts::default()).await?;
        if inputs.products.is_empty() {
            return Ok(JobOutcome::Skipped);
        }

        let bundle = analysis::build_bundle(&inputs, None);
        analysis::persist_bundle(&self.ctx.db, payload.tenant_id, &bundle).await?;

        for (module, rec) in &bundle.modules {
            if !rec.applicable {
                continue;
            }
            let event = FeedEvent::AnalysisReady {
                tenant_id: payload.tenant_id,
                module: module.clone(),
                top_insight: rec.insights.first().cloned().unwrap_or_default(),
            };
            enqueue(
                &self.ctx.queue,
                QueueName::Feed,
                "feed:emit",
                json!({ "event": event }),
                JobOptions::default(),
            )
            .await?;
        }
        Ok(JobOutcome::Completed)
    }
}
