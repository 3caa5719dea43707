use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fernhill_lib::db;
use fernhill_lib::directory::http::{router, DirectoryState};
use fernhill_lib::migrate::{self, SnapshotSource};
use fernhill_lib::schema::DIRECTORY_MIGRATIONS;

/// Shared directory service for Fernhill clinics.
#[derive(Debug, Parser)]
#[command(name = "fernhill-directory", version)]
struct Args {
    /// Path to the directory database file.
    #[arg(long, default_value = "fernhill-directory.db")]
    db: PathBuf,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8700")]
    listen: SocketAddr,

    /// Shared secret required by `POST /v1/onboard`.
    #[arg(long, env = "FERNHILL_APP_SECRET")]
    app_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    fernhill_lib::logging::init();
    let args = Args::parse();

    let pool = db::open_pool(&args.db, None)
        .await
        .context("open directory store")?;
    migrate::migrate(
        &pool,
        Some(SnapshotSource {
            path: &args.db,
            cipher_key: None,
        }),
        DIRECTORY_MIGRATIONS,
    )
    .await
    .context("migrate directory store")?;

    let state = Arc::new(DirectoryState {
        pool,
        app_secret: args.app_secret,
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(target: "fernhill", event = "directory_listening", addr = %args.listen);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "fernhill", event = "directory_shutdown");
        })
        .await
        .context("serve directory api")?;

    Ok(())
}
