//! Environment-driven configuration. Loaded once at startup and passed
//! through a context object; no hidden globals.

use std::env;
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Queue broker URL. The queue is Postgres-backed and may share the
    /// primary database, but the two are configured independently.
    pub queue_url: String,
    /// Root directory for verbatim raw payload blobs.
    pub blob_root: PathBuf,

    pub shopify_api_key: String,
    pub shopify_api_secret: String,
    pub shopify_scopes: Vec<String>,

    /// Base URL the OAuth callback redirects back to.
    pub app_base_url: String,
    /// Shared secret for authenticated cron invocations.
    pub cron_secret: String,

    /// Base URL of the public civic data portal (CKAN-style JSON API).
    pub civic_base_url: String,

    pub listen_port: u16,
    pub ingest_cron: String,
    pub metrics_cron: String,

    /// Gate for the OAuth callback soft-match fallback. Off by default;
    /// every soft-match is audited with a warning when enabled.
    pub allow_callback_soft_match: bool,
}

impl AppConfig {
    /// Load from environment variables. Absence of any required name is a
    /// startup-fatal `Config` error.
    pub fn from_env() -> CoreResult<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            queue_url: required("QUEUE_URL")?,
            blob_root: env::var("BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage/raw")),
            shopify_api_key: required("SHOPIFY_API_KEY")?,
            shopify_api_secret: required("SHOPIFY_API_SECRET")?,
            shopify_scopes: required("SHOPIFY_SCOPES")?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            app_base_url: required("APP_BASE_URL")?,
            cron_secret: required("CRON_SECRET")?,
            civic_base_url: env::var("CIVIC_BASE_URL")
                .unwrap_or_else(|_| "https://datos.hcdn.gob.ar".to_string()),
            listen_port: parsed_or("PORT", 8080)?,
            ingest_cron: env::var("INGEST_CRON").unwrap_or_else(|_| "0 */6 * * *".to_string()),
            metrics_cron: env::var("METRICS_CRON").unwrap_or_else(|_| "0 3 * * *".to_string()),
            allow_callback_soft_match: flag("ALLOW_CALLBACK_SOFT_MATCH"),
        })
    }
}

fn required(key: &str) -> CoreResult<String> {
    env::var(key).map_err(|_| CoreError::Config(format!("missing required env var {key}")))
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> CoreResult<T> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| CoreError::Config(format!("env var {key} has invalid value {raw:?}"))),
    }
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}
