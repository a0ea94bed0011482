//! Source adapter contracts and the per-source fetch drivers.
//!
//! Every adapter exposes the same `Fetch → RawPayload` contract so the
//! ingest worker can drive any source through one code path. OAuth-based
//! sources additionally expose the token lifecycle.

pub mod civic;
pub mod shopify;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use pulso_core::model::DataType;
use pulso_core::{AppConfig, CoreError};
use pulso_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "pulso-adapters";

/// Verbatim fetched bytes plus the audit fields the source-ref store needs.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub source_key: String,
    pub data_type: DataType,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Dedup key of one source endpoint: `<source>:<identity>:<data_type>`.
pub fn source_key(source: &str, identity: &str, data_type: DataType) -> String {
    format!("{source}:{identity}:{}", data_type.as_str())
}

/// Auth material for a connection-backed fetch. Public sources pass none.
#[derive(Debug, Clone)]
pub struct ConnectionAuth {
    pub shop_domain: String,
    pub access_token: String,
}

pub struct FetchContext<'a> {
    pub run_id: Uuid,
    pub http: &'a HttpFetcher,
    pub auth: Option<&'a ConnectionAuth>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub topic: String,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source authentication failed: {0}")]
    Auth(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected source response: {0}")]
    Schema(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        if err.is_auth() {
            AdapterError::Auth(err.to_string())
        } else {
            AdapterError::Unavailable(err.to_string())
        }
    }
}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Auth(msg) => CoreError::Auth(msg),
            AdapterError::Unavailable(msg) => CoreError::TransientIo(msg),
            AdapterError::Schema(msg) => CoreError::SourceSchema(msg),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// The data types this adapter can fetch, in ingestion order.
    fn data_types(&self) -> Vec<DataType>;

    async fn fetch(
        &self,
        ctx: &FetchContext<'_>,
        data_type: DataType,
    ) -> Result<RawPayload, AdapterError>;

    /// Register provider-initiated change notifications pointing at
    /// `callback_base`. Public pull-only sources return an empty list.
    async fn register_change_notifications(
        &self,
        ctx: &FetchContext<'_>,
        callback_base: &str,
    ) -> Result<Vec<RegistrationOutcome>, AdapterError>;
}

pub fn adapter_for_source(
    source: &str,
    config: &AppConfig,
) -> Option<Box<dyn SourceAdapter>> {
    match source {
        "shopify" => Some(Box::new(shopify::ShopifyAdapter::new(
            shopify::ShopifyCredentials {
                api_key: config.shopify_api_key.clone(),
                api_secret: config.shopify_api_secret.clone(),
                scopes: config.shopify_scopes.clone(),
                app_base_url: config.app_base_url.clone(),
            },
        ))),
        "civic" => Some(Box::new(civic::CivicAdapter::new(
            config.civic_base_url.clone(),
        ))),
        _ => None,
    }
}

pub fn known_sources() -> [&'static str; 2] {
    ["shopify", "civic"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_keys_are_scoped_per_data_type() {
        assert_eq!(
            source_key("shopify", "s.myshopify.com", DataType::Products),
            "shopify:s.myshopify.com:products"
        );
        assert_ne!(
            source_key("shopify", "s.myshopify.com", DataType::Products),
            source_key("shopify", "s.myshopify.com", DataType::Orders),
        );
    }

    #[test]
    fn fetch_errors_map_to_the_taxonomy() {
        let auth: CoreError = AdapterError::Auth("bad token".into()).into();
        assert_eq!(auth.code(), "auth_failed");
        let unavailable: CoreError = AdapterError::Unavailable("timeout".into()).into();
        assert_eq!(unavailable.code(), "transient_io");
        let schema: CoreError = AdapterError::Schema("not json".into()).into();
        assert_eq!(schema.code(), "source_schema");
    }
}
