use anyhow::{Context, Result};
use parquedb_types::blob_storage::BlobStorage;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// A connection to the shard's durable state: an embedded SQL pool and a
/// blob storage client.
///
/// The pool is capped at a single connection: a shard is single-writer and
/// the serial execution model depends on it.
#[derive(Debug, Clone)]
pub struct ShardConnection {
    pub db_pool: SqlitePool,
    pub blob_storage: Arc<BlobStorage>,
}

impl ShardConnection {
    pub fn new(db_pool: SqlitePool, blob_storage: Arc<BlobStorage>) -> Self {
        Self {
            db_pool,
            blob_storage,
        }
    }
}

/// Opens the shard database, creating the file if missing.
pub async fn open_shard_db(db_uri: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_uri)
        .with_context(|| format!("parsing database uri {db_uri}"))?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| "connecting to shard database")
}

/// Connects to a shard's durable state.
pub async fn connect_to_shard(db_uri: &str, object_store_url: &str) -> Result<ShardConnection> {
    info!("connecting to blob storage");
    let blob_storage = Arc::new(
        BlobStorage::connect(object_store_url).with_context(|| "connecting to blob storage")?,
    );
    let pool = open_shard_db(db_uri).await?;
    Ok(ShardConnection::new(pool, blob_storage))
}
