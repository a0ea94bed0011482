//! Worker pools: one tokio task per concurrency slot per queue, each
//! processing one job at a time to completion under the queue's soft
//! deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pulso_core::{CoreError, CoreResult};

use crate::{claim_next, complete_job, fail_job, Job, QueueName};

const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The job found nothing to do (e.g. an unchanged payload checksum).
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> CoreResult<JobOutcome>;
}

/// Job-name → handler table, shared across the queue pools.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_name.to_string(), handler);
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_name).cloned()
    }
}

/// Spawn `concurrency` worker loops for one queue. The handles run until
/// the process exits.
pub fn spawn_pool(
    pool: PgPool,
    queue: QueueName,
    registry: Arc<HandlerRegistry>,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|slot| {
            let pool = pool.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                info!(queue = queue.as_str(), slot, "queue worker started");
                worker_loop(pool, queue, registry).await;
            })
        })
        .collect()
}

async fn worker_loop(pool: PgPool, queue: QueueName, registry: Arc<HandlerRegistry>) {
    loop {
        match claim_next(&pool, queue).await {
            Ok(Some(job)) => {
                process_one(&pool, queue, &registry, job).await;
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(err) => {
                warn!(queue = queue.as_str(), %err, "claim failed; backing off");
                tokio::time::sleep(IDLE_POLL * 4).await;
            }
        }
    }
}

async fn process_one(
    pool: &PgPool,
    queue: QueueName,
    registry: &HandlerRegistry,
    job: Job,
) {
    let Some(handler) = registry.get(&job.name) else {
        let err = CoreError::Config(format!("no handler registered for job {}", job.name));
        error!(queue = queue.as_str(), job = %job.name, %err, "dead-lettering");
        let _ = fail_job(pool, &job, &err).await;
        return;
    };

    let deadline = queue.soft_deadline();
    let outcome = match tokio::time::timeout(deadline, handler.handle(&job)).await {
        Ok(result) => result,
        // Cooperative stop: the handler future is dropped at the
        // suspension point it was parked on, and the job retries.
        Err(_) => Err(CoreError::transient(format!(
            "soft deadline of {}s expired",
            deadline.as_secs()
        ))),
    };

    match outcome {
        Ok(outcome) => {
            if let Err(err) = complete_job(pool, &job, json!({ "outcome": outcome.as_str() })).await
            {
                warn!(job_id = job.id, %err, "failed to record completion");
            }
        }
        Err(err) => {
            warn!(
                queue = queue.as_str(),
                job = %job.name,
                job_id = job.id,
                attempt = job.attempts_made + 1,
                %err,
                "job failed"
            );
            if let Err(record_err) = fail_job(pool, &job, &err).await {
                warn!(job_id = job.id, %record_err, "failed to record failure");
            }
        }
    }
}
