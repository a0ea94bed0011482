//! Source-ref store: raw blob persistence, checksums, the shared HTTP
//! fetch plumbing and the fetch/run audit tables.

pub mod blob;
pub mod db;
pub mod fetch;

pub use blob::{BlobStore, LocalBlobStore};
pub use db::{map_db_err, RecordedFetch};
pub use fetch::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};

use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "pulso-storage";

/// SHA-256 over the canonical payload bytes, hex-encoded. This is the
/// checksum the dedup check in `db::record_fetch` keys on.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Embedded schema migrations, applied by the CLI `migrate` subcommand and
/// by `serve` on startup.
pub async fn run_migrations(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn checksum_differs_on_any_change() {
        assert_ne!(sha256_hex(b"{\"a\":1}"), sha256_hex(b"{\"a\":2}"));
    }
}
