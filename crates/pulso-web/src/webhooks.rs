//! Provider change notifications. The raw body is verified against the
//! HMAC header before anything is written; once a notification has been
//! recorded, every internal error still answers `200` so the provider
//! stops retrying.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use pulso_adapters::shopify::verify_webhook;
use pulso_core::model::{DataType, SyncStatus};
use pulso_core::CoreResult;
use pulso_queue::{enqueue, JobOptions, QueueName};
use pulso_storage::db as audit;
use pulso_storage::{sha256_hex, BlobStore as _};
use pulso_sync::normalize::NormalizeJobPayload;
use pulso_sync::repo;

use crate::AppState;

const HEADER_SHOP: &str = "x-shopify-shop-domain";
const HEADER_TOPIC: &str = "x-shopify-topic";
const HEADER_HMAC: &str = "x-shopify-hmac-sha256";

/// Data type a notification topic feeds, if any.
pub fn topic_data_type(topic: &str) -> Option<DataType> {
    match topic {
        "products/update" | "products/create" => Some(DataType::Products),
        "orders/create" | "orders/updated" => Some(DataType::Orders),
        _ => None,
    }
}

pub async fn shopify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let shop = headers.get(HEADER_SHOP).and_then(|v| v.to_str().ok());
    let topic = headers.get(HEADER_TOPIC).and_then(|v| v.to_str().ok());
    let signature = headers.get(HEADER_HMAC).and_then(|v| v.to_str().ok());

    // Missing routing headers are a malformed request, not a bad signature.
    let (Some(shop), Some(topic)) = (shop, topic) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing routing headers" })),
        )
            .into_response();
    };

    if !signature
        .map(|sig| verify_webhook(&state.ctx.config.shopify_api_secret, &body, sig))
        .unwrap_or(false)
    {
        if let Ok(Some(connection)) = repo::connection_by_shop(&state.ctx.db, shop).await {
            let strikes = repo::record_signature_failure(&state.ctx.db, connection.id).await;
            if let Ok(strikes) = strikes {
                warn!(%shop, strikes, "webhook signature rejected");
            }
        }
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid HMAC" })),
        )
            .into_response();
    }

    if let Err(err) = record_notification(&state, shop, topic, &body).await {
        // Recorded-or-not, the provider must not retry a verified call.
        warn!(%shop, topic, %err, "webhook processing failed after verification");
    }

    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn record_notification(
    state: &AppState,
    shop: &str,
    topic: &str,
    body: &[u8],
) -> CoreResult<()> {
    let Some(connection) = repo::connection_by_shop(&state.ctx.db, shop).await? else {
        warn!(%shop, topic, "notification for unknown shop dropped");
        return Ok(());
    };

    if topic == "app/uninstalled" {
        // Token is gone; the tenant must re-auth.
        repo::set_sync_status(&state.ctx.db, connection.id, SyncStatus::Error).await?;
        return Ok(());
    }

    let Some(data_type) = topic_data_type(topic) else {
        warn!(%shop, topic, "notification topic has no data type; dropped");
        return Ok(());
    };

    let fetched_at = Utc::now();
    let source_name = format!("shopify-webhook:{shop}");
    let run = audit::start_run(&state.ctx.db, &source_name, data_type).await?;

    // Webhooks carry single entities; wrap them in the list schema the
    // normalizer declares.
    let wrapped = wrap_entity_payload(data_type, body)?;
    let checksum = sha256_hex(&wrapped);
    let source_key = format!("shopify-webhook:{shop}:{}:{checksum}", data_type.as_str());

    let blob_location = state.ctx.blob.put(data_type, fetched_at, &wrapped).await?;
    let recorded = audit::record_fetch(
        &state.ctx.db,
        run.id,
        &source_key,
        data_type,
        &checksum,
        &blob_location,
        fetched_at,
    )
    .await?;

    if !recorded.is_new {
        audit::complete_run(&state.ctx.db, run.id, 0, 1, 0).await?;
        return Ok(());
    }

    let payload = NormalizeJobPayload {
        source_ref_id: recorded.source_ref.id,
        tenant_id: connection.tenant_id,
    };
    enqueue(
        &state.ctx.queue,
        QueueName::Normalize,
        "normalize:source-ref",
        serde_json::to_value(&payload).map_err(pulso_core::CoreError::schema)?,
        JobOptions::default(),
    )
    .await?;
    Ok(())
}

/// Wrap a single-entity webhook body as the declared list payload.
fn wrap_entity_payload(data_type: DataType, body: &[u8]) -> CoreResult<Vec<u8>> {
    let entity: serde_json::Value =
        serde_json::from_slice(body).map_err(pulso_core::CoreError::schema)?;
    let wrapped = match data_type {
        DataType::Products => json!({ "products": [entity] }),
        DataType::Orders => json!({ "orders": [entity] }),
        other => {
            return Err(pulso_core::CoreError::schema(format!(
                "no webhook wrapper for data type {}",
                other.as_str()
            )))
        }
    };
    serde_json::to_vec(&wrapped).map_err(pulso_core::CoreError::schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_map_to_data_types() {
        assert_eq!(topic_data_type("products/update"), Some(DataType::Products));
        assert_eq!(topic_data_type("orders/create"), Some(DataType::Orders));
        assert_eq!(topic_data_type("app/uninstalled"), None);
    }

    #[test]
    fn single_entity_bodies_are_wrapped_as_lists() {
        let wrapped = wrap_entity_payload(DataType::Products, br#"{"id": 1}"#).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wrapped).unwrap();
        assert_eq!(value["products"][0]["id"], 1);
    }
}
