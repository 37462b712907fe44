//! ParqueDB Server
//!
//! Exposes a single shard's write/read surface plus the compaction and MV
//! refresh coordinators over HTTP. Durable state lives in sqlite files and
//! an object store (local directory or any URL the object_store crate can
//! parse).

mod api;

use anyhow::{Context, Result};
use api::AppState;
use axum::Extension;
use axum::Router;
use axum::routing::{get, post};
use clap::{Parser, Subcommand};
use parquedb_shard::engine::{ShardConfig, ShardEngine};
use parquedb_shard::shard_connection::ShardConnection;
use parquedb_streaming::{StreamingMvConfig, StreamingMvEngine};
use parquedb_types::blob_storage::BlobStorage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "ParqueDB Server")]
#[clap(about = "ParqueDB shard and coordinator server", version, author)]
#[clap(arg_required_else_help(true))]
struct Cli {
    #[clap(long, default_value = "0.0.0.0:8081")]
    listen_endpoint_http: SocketAddr,

    #[clap(long, default_value = "shard-0")]
    shard_id: String,

    #[clap(subcommand)]
    spec: StoreSpec,
}

#[derive(Subcommand, Debug)]
enum StoreSpec {
    /// Everything under one local directory.
    Local { path: PathBuf },
    /// Sqlite uris plus an object store url.
    Remote {
        shard_db_uri: String,
        coordinator_db_uri: String,
        object_store_url: String,
    },
}

async fn build_state(args: &Cli) -> Result<AppState> {
    let (connection, coordinator_pool) = match &args.spec {
        StoreSpec::Local { path } => {
            std::fs::create_dir_all(path.join("objects"))
                .with_context(|| "creating object directory")?;
            let blob_storage = Arc::new(BlobStorage::new(
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path.join("objects"))
                        .with_context(|| "opening local object store")?,
                ),
                object_store::path::Path::default(),
            ));
            let shard_db_uri = format!("sqlite://{}", path.join("shard.db").display());
            let coordinator_db_uri = format!("sqlite://{}", path.join("coordinator.db").display());
            let pool = parquedb_shard::shard_connection::open_shard_db(&shard_db_uri).await?;
            let coordinator_pool =
                parquedb_shard::shard_connection::open_shard_db(&coordinator_db_uri).await?;
            (ShardConnection::new(pool, blob_storage), coordinator_pool)
        }
        StoreSpec::Remote {
            shard_db_uri,
            coordinator_db_uri,
            object_store_url,
        } => {
            let connection =
                parquedb_shard::shard_connection::connect_to_shard(shard_db_uri, object_store_url)
                    .await?;
            let coordinator_pool =
                parquedb_shard::shard_connection::open_shard_db(coordinator_db_uri).await?;
            (connection, coordinator_pool)
        }
    };

    parquedb_shard::sql_migration::execute_migration(connection.db_pool.clone())
        .await
        .with_context(|| "migrating shard database")?;
    parquedb_lakehouse::sql_coordinator_schema::execute_migration(coordinator_pool.clone())
        .await
        .with_context(|| "migrating coordinator database")?;

    let engine = Arc::new(ShardEngine::new(
        connection,
        ShardConfig {
            shard_id: args.shard_id.clone(),
            ..ShardConfig::default()
        },
    ));
    let streaming = Arc::new(StreamingMvEngine::new(StreamingMvConfig::default()));
    engine.register_sink(streaming.clone());
    let mv_refresh = Arc::new(parquedb_lakehouse::mv_refresh::MvRefreshCoordinator::new(
        coordinator_pool.clone(),
    ));
    Ok(AppState {
        engine,
        streaming,
        mv_refresh,
        coordinator_pool,
    })
}

async fn serve_http(args: &Cli, state: AppState) -> Result<()> {
    let streaming = state.streaming.clone();
    tokio::spawn(async move {
        // fires timed-out view batches when no event arrives to do it
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            interval.tick().await;
            streaming.tick().await;
        }
    });

    let app = Router::new()
        .route("/shard/create", post(api::create))
        .route("/shard/create-many", post(api::create_many))
        .route("/shard/get", post(api::get_entity))
        .route("/shard/update", post(api::update))
        .route("/shard/delete", post(api::delete))
        .route("/shard/link", post(api::link))
        .route("/shard/unlink", post(api::unlink))
        .route("/shard/get-relationships", post(api::get_relationships))
        .route("/shard/flush", post(api::flush))
        .route("/compaction/update", post(api::compaction_update))
        .route("/compaction/notify", post(api::compaction_notify))
        .route("/compaction/confirm-dispatch", post(api::compaction_confirm_dispatch))
        .route(
            "/compaction/rollback-processing",
            post(api::compaction_rollback_processing),
        )
        .route(
            "/compaction/workflow-complete",
            post(api::compaction_workflow_complete),
        )
        .route("/compaction/status", get(api::compaction_status))
        .route("/register-mv", post(api::register_mv))
        .route("/notify-change", post(api::notify_change))
        .route("/get-ready-mvs", post(api::get_ready_mvs))
        .route("/confirm-dispatch", post(api::mv_confirm_dispatch))
        .route("/rollback-processing", post(api::mv_rollback_processing))
        .route("/workflow-complete", post(api::mv_workflow_complete))
        .route("/status", get(api::status))
        .layer(RequestBodyLimitLayer::new(100 * 1024 * 1024))
        .layer(Extension(state));
    let listener = tokio::net::TcpListener::bind(args.listen_endpoint_http)
        .await
        .with_context(|| "binding http listener")?;
    info!("serving http on {}", args.listen_endpoint_http);
    axum::serve(listener, app).await.with_context(|| "serving")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();
    let state = build_state(&args).await?;
    serve_http(&args, state).await
}
