// src/server/mod.rs

//! Process bootstrap: open the catalog, run crash recovery, spawn the
//! scheduler's single worker task, bind the admission socket, and accept
//! connections for the lifetime of the process.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::connection;
use crate::core::catalog::CatalogStore;
use crate::core::scheduler;

pub async fn run(config: Config) -> Result<()> {
    let store = CatalogStore::open(&config.database_file)
        .await
        .with_context(|| format!("opening catalog '{}'", config.database_file))?;

    let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = scheduler::run(scheduler_rx, store).await {
            error!(error = %e, "scheduler task exited");
        }
    });

    if std::path::Path::new(&config.socket_path).exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("removing stale socket '{}'", config.socket_path))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding socket '{}'", config.socket_path))?;
    std::fs::set_permissions(
        &config.socket_path,
        std::fs::Permissions::from_mode(config.socket_mode),
    )
    .with_context(|| format!("setting permissions on '{}'", config.socket_path))?;

    info!(
        socket = %config.socket_path,
        mode = format!("{:o}", config.socket_mode),
        database = %config.database_file,
        "qmanagerd listening"
    );

    let next_session_id = AtomicU64::new(1);
    loop {
        let (stream, _addr) = listener.accept().await.context("accepting connection")?;
        let session_id = next_session_id.fetch_add(1, Ordering::Relaxed);
        let tx = scheduler_tx.clone();
        tokio::spawn(connection::handle_connection(stream, session_id, tx));
    }
}
