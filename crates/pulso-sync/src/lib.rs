//! Pipeline orchestration: ingest, normalize, derived-state and feed job
//! handlers wired onto the named queues, plus the inline initial sync used
//! by the OAuth callback.

pub mod civic;
pub mod commerce;
pub mod feed;
pub mod handlers;
pub mod ingest;
pub mod inline;
pub mod normalize;
pub mod repo;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use pulso_core::AppConfig;
use pulso_queue::worker::HandlerRegistry;
use pulso_storage::{BlobStore, HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub use inline::{run_initial_sync, SyncCounts};

pub const CRATE_NAME: &str = "pulso-sync";

/// Everything a pipeline stage needs, constructed once at startup and
/// passed through; no hidden globals.
pub struct PipelineCtx {
    pub db: PgPool,
    pub queue: PgPool,
    pub blob: Arc<dyn BlobStore>,
    pub http: HttpFetcher,
    pub config: AppConfig,
}

impl PipelineCtx {
    pub fn new(
        db: PgPool,
        queue: PgPool,
        blob: Arc<dyn BlobStore>,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        // Shopify's Admin API admits roughly two requests per second per
        // shop; pace all adapter fetches under one bucket rather than
        // burning the 429-retry budget.
        let http = HttpFetcher::new(HttpClientConfig {
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(500),
            }),
            ..Default::default()
        })?;
        Ok(Self {
            db,
            queue,
            blob,
            http,
            config,
        })
    }
}

/// The full handler table for the four named queues.
pub fn register_handlers(ctx: Arc<PipelineCtx>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "ingest:all",
        Arc::new(ingest::IngestAllHandler { ctx: ctx.clone() }),
    );
    registry.register(
        "ingest:fetch",
        Arc::new(ingest::IngestFetchHandler { ctx: ctx.clone() }),
    );
    registry.register(
        "normalize:source-ref",
        Arc::new(normalize::NormalizeHandler { ctx: ctx.clone() }),
    );
    registry.register(
        "metrics:legislator",
        Arc::new(handlers::MetricsLegislatorHandler { ctx: ctx.clone() }),
    );
    registry.register(
        "metrics:recompute-all",
        Arc::new(handlers::MetricsRecomputeAllHandler { ctx: ctx.clone() }),
    );
    registry.register(
        "analysis:tenant",
        Arc::new(handlers::AnalysisTenantHandler { ctx: ctx.clone() }),
    );
    registry.register("feed:emit", Arc::new(feed::FeedEmitHandler { ctx }));
    registry
}
