//! Inline initial sync: the OAuth callback's critical section. Fetches and
//! normalises the commerce data types synchronously so the user returns to
//! the app with data already present; failure marks the connection `error`
//! while background follow-ups still go through the queue.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use pulso_adapters::ConnectionAuth;
use pulso_core::model::{Connection, DataType, SyncStatus};
use pulso_core::CoreResult;

use crate::ingest::{fetch_and_record, FetchResult};
use crate::normalize::{enqueue_followups, normalize_source_ref};
use crate::{repo, PipelineCtx};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncCounts {
    pub products: i32,
    pub orders: i32,
    pub inventory: i32,
}

/// Fetch, dedup and normalize every commerce data type for one
/// connection, then record the sync on the connection row.
pub async fn run_initial_sync(ctx: &PipelineCtx, connection: &Connection) -> CoreResult<SyncCounts> {
    repo::set_sync_status(&ctx.db, connection.id, SyncStatus::Syncing).await?;

    match sync_all_types(ctx, connection).await {
        Ok(counts) => {
            repo::record_sync_success(
                &ctx.db,
                connection.id,
                counts.products,
                counts.orders,
                Utc::now(),
            )
            .await?;
            info!(
                shop = %connection.shop_domain,
                products = counts.products,
                orders = counts.orders,
                "inline sync complete"
            );
            Ok(counts)
        }
        Err(err) => {
            warn!(shop = %connection.shop_domain, %err, "inline sync failed");
            repo::set_sync_status(&ctx.db, connection.id, SyncStatus::Error).await?;
            Err(err)
        }
    }
}

async fn sync_all_types(ctx: &PipelineCtx, connection: &Connection) -> CoreResult<SyncCounts> {
    let auth = ConnectionAuth {
        shop_domain: connection.shop_domain.clone(),
        access_token: connection.access_token.clone(),
    };

    let mut counts = SyncCounts::default();
    for data_type in DataType::commerce_types() {
        let result = fetch_and_record(ctx, "shopify", data_type, Some(&auth)).await?;
        let FetchResult::New(source_ref) = result else {
            continue;
        };

        let outcome = normalize_source_ref(ctx, source_ref.id, connection.tenant_id).await?;
        enqueue_followups(ctx, &outcome).await?;

        match data_type {
            DataType::Products => counts.products = outcome.processed,
            DataType::Orders => counts.orders = outcome.processed,
            DataType::Inventory => counts.inventory = outcome.processed,
            _ => {}
        }
    }
    Ok(counts)
}
