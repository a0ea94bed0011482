//! Cron-driven periodic job emitter. Schedule lines are data supplied by
//! configuration, not code; each fire enqueues a queue job and collapses
//! with any identical job still waiting.

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use pulso_core::AppConfig;

use crate::{enqueue_unique, verify_connectivity, JobOptions, QueueName};

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub cron: String,
    pub queue: QueueName,
    pub job_name: String,
}

/// The two built-in schedules: periodic ingestion of every source and the
/// nightly full metric recompute.
pub fn built_in_schedules(config: &AppConfig) -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            cron: config.ingest_cron.clone(),
            queue: QueueName::Ingest,
            job_name: "ingest:all".to_string(),
        },
        ScheduleEntry {
            cron: config.metrics_cron.clone(),
            queue: QueueName::Metrics,
            job_name: "metrics:recompute-all".to_string(),
        },
    ]
}

/// Build and start the scheduler. Refuses to run when the queue store is
/// unreachable. Missed fires during downtime collapse to a single run:
/// nothing is replayed, and `enqueue_unique` drops a fire whose job is
/// still waiting from the previous one.
pub async fn start_scheduler(pool: PgPool, entries: Vec<ScheduleEntry>) -> Result<JobScheduler> {
    verify_connectivity(&pool)
        .await
        .context("scheduler startup: queue connectivity check")?;

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    for entry in entries {
        let pool = pool.clone();
        let line = entry.clone();
        let job = Job::new_async(entry.cron.as_str(), move |_uuid, _lock| {
            let pool = pool.clone();
            let line = line.clone();
            Box::pin(async move {
                match enqueue_unique(
                    &pool,
                    line.queue,
                    &line.job_name,
                    json!({}),
                    JobOptions::default(),
                )
                .await
                {
                    Ok(Some(job_id)) => {
                        info!(job = %line.job_name, job_id, "scheduled fire enqueued")
                    }
                    Ok(None) => {
                        info!(job = %line.job_name, "previous fire still queued; collapsed")
                    }
                    Err(err) => warn!(job = %line.job_name, %err, "scheduled enqueue failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", entry.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
    }

    sched.start().await.context("starting scheduler")?;
    Ok(sched)
}
