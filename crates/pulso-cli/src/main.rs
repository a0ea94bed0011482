//! Operational entry points: the API server, the queue workers with the
//! scheduler, migrations, and the batch ingestion CLI.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use pulso_core::model::{DataType, PUBLIC_TENANT_ID};
use pulso_core::{AppConfig, CoreError};
use pulso_queue::scheduler::{built_in_schedules, start_scheduler};
use pulso_queue::worker::spawn_pool;
use pulso_queue::QueueName;
use pulso_storage::LocalBlobStore;
use pulso_sync::ingest::fetch_and_record;
use pulso_sync::normalize::{enqueue_followups, normalize_source_ref};
use pulso_sync::{register_handlers, PipelineCtx};
use pulso_web::{serve, AppState};

// Batch ingestion exit codes.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_SOURCE_UNAVAILABLE: u8 = 2;
const EXIT_PARTIAL: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "pulso")]
#[command(about = "Tenant-scoped ingestion and derived-state engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API surface.
    Serve,
    /// Run the queue worker pools and the cron scheduler.
    Work,
    /// Apply schema migrations.
    Migrate,
    /// Fetch and normalize sources once, synchronously.
    Ingest {
        /// Restrict to one source (`shopify` or `civic`).
        #[arg(long)]
        source: Option<String>,
    },
    /// Recompute every legislator metric row.
    Recompute,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn build_ctx(config: AppConfig) -> anyhow::Result<Arc<PipelineCtx>> {
    let db = PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let queue = PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.queue_url)
        .await
        .context("connecting to queue store")?;
    let blob = Arc::new(LocalBlobStore::new(config.blob_root.clone()));
    Ok(Arc::new(PipelineCtx::new(db, queue, blob, config)?))
}

async fn run(command: Commands, config: AppConfig) -> anyhow::Result<u8> {
    match command {
        Commands::Migrate => {
            let db = PgPoolOptions::new()
                .connect(&config.database_url)
                .await
                .context("connecting to database")?;
            pulso_storage::run_migrations(&db).await?;
            info!("migrations applied");
            Ok(EXIT_OK)
        }
        Commands::Serve => {
            let ctx = build_ctx(config).await?;
            pulso_storage::run_migrations(&ctx.db).await?;
            serve(AppState::new(ctx)).await?;
            Ok(EXIT_OK)
        }
        Commands::Work => {
            let ctx = build_ctx(config.clone()).await?;
            let registry = Arc::new(register_handlers(ctx.clone()));

            let mut handles = Vec::new();
            for queue in QueueName::all() {
                handles.extend(spawn_pool(
                    ctx.queue.clone(),
                    queue,
                    registry.clone(),
                    queue.default_concurrency(),
                ));
            }

            let _scheduler =
                start_scheduler(ctx.queue.clone(), built_in_schedules(&config)).await?;
            info!("workers and scheduler running");

            for handle in handles {
                let _ = handle.await;
            }
            Ok(EXIT_OK)
        }
        Commands::Ingest { source } => {
            let ctx = build_ctx(config).await?;
            Ok(ingest_once(&ctx, source.as_deref()).await)
        }
        Commands::Recompute => {
            let ctx = build_ctx(config).await?;
            let recomputed = pulso_metrics::legislative::recompute_all(&ctx.db).await?;
            info!(recomputed, "metric rows recomputed");
            Ok(EXIT_OK)
        }
    }
}

/// Synchronous batch ingestion. Exit codes: 0 success, 2 when every data
/// type failed to fetch, 3 when only some did.
async fn ingest_once(ctx: &Arc<PipelineCtx>, source: Option<&str>) -> u8 {
    let mut attempted = 0usize;
    let mut failed = 0usize;

    let run_civic = source.is_none_or(|s| s == "civic");
    if run_civic {
        for data_type in DataType::civic_types() {
            attempted += 1;
            if let Err(err) = ingest_one(ctx, "civic", data_type).await {
                warn!(data_type = data_type.as_str(), %err, "civic ingest failed");
                failed += 1;
            }
        }
    }

    let run_shopify = source.is_none_or(|s| s == "shopify");
    if run_shopify {
        match pulso_sync::repo::all_connections(&ctx.db).await {
            Ok(connections) => {
                for connection in connections {
                    if let Err(err) = pulso_sync::run_initial_sync(ctx, &connection).await {
                        warn!(shop = %connection.shop_domain, %err, "shopify ingest failed");
                        failed += 1;
                    }
                    attempted += 1;
                }
            }
            Err(err) => {
                error!(%err, "listing connections failed");
                return EXIT_SOURCE_UNAVAILABLE;
            }
        }
    }

    if attempted == 0 {
        info!("nothing to ingest");
        EXIT_OK
    } else if failed == 0 {
        EXIT_OK
    } else if failed == attempted {
        EXIT_SOURCE_UNAVAILABLE
    } else {
        EXIT_PARTIAL
    }
}

async fn ingest_one(
    ctx: &Arc<PipelineCtx>,
    source: &str,
    data_type: DataType,
) -> Result<(), CoreError> {
    match fetch_and_record(ctx, source, data_type, None).await? {
        pulso_sync::ingest::FetchResult::Unchanged => Ok(()),
        pulso_sync::ingest::FetchResult::New(source_ref) => {
            let outcome = normalize_source_ref(ctx, source_ref.id, PUBLIC_TENANT_ID).await?;
            enqueue_followups(ctx, &outcome).await?;
            info!(
                data_type = data_type.as_str(),
                processed = outcome.processed,
                "ingested"
            );
            Ok(())
        }
    }
}
