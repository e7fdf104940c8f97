use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;
mod coordinator;
mod db;
mod error;
mod http;
mod models;
mod parser;
mod progress;
mod telemetry;
mod upsert;
mod worker;

use config::{Cli, Commands, IngestArgs, ServeArgs};
use coordinator::{Coordinator, UploadedFile};
use db::{PgGradeStore, SharedStore};
use models::ProgressEvent;
use progress::ProgressRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(&cli.log_level);

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to the grades Postgres instance")?;

    match cli.command {
        Commands::Serve(args) => serve(&database_url, args).await,
        Commands::Import { csv, ingest } => import(&database_url, csv, ingest).await,
    }
}

async fn connect(database_url: &str, ingest: &IngestArgs) -> anyhow::Result<SharedStore> {
    let pool = PgPoolOptions::new()
        .max_connections(ingest.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(Arc::new(PgGradeStore::new(pool)))
}

async fn serve(database_url: &str, args: ServeArgs) -> anyhow::Result<()> {
    let store = connect(database_url, &args.ingest).await?;
    let registry = Arc::new(ProgressRegistry::new(args.progress_retention()));
    let sweeper = ProgressRegistry::spawn_sweeper(registry.clone(), args.sweep_interval());

    let coordinator = Coordinator::new(store, args.ingest.upsert_options(), registry);
    let router = http::build_router(
        Arc::new(http::AppState { coordinator }),
        args.max_upload_bytes,
    );

    let addr = args.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        batch_size = args.ingest.batch_size,
        insert_mode = ?args.ingest.insert_mode,
        "grades ingest server starting"
    );

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    result.context("server terminated unexpectedly")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn import(database_url: &str, paths: Vec<PathBuf>, ingest: IngestArgs) -> anyhow::Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        files.push(UploadedFile {
            name,
            contents: contents.into(),
        });
    }

    let store = connect(database_url, &ingest).await?;
    let coordinator = Coordinator::new(
        store,
        ingest.upsert_options(),
        Arc::new(ProgressRegistry::default()),
    );

    let mut failed = 0usize;
    let mut events = Box::pin(coordinator.ingest_all(files));
    while let Some(event) = events.next().await {
        if matches!(event, ProgressEvent::Failed { .. }) {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&event)?);
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) failed to ingest", paths.len());
    }
    info!(files = paths.len(), "import finished");
    Ok(())
}
