use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::db::MAX_ROWS_PER_STATEMENT;
use crate::upsert::{InsertMode, UpsertOptions, DEFAULT_BATCH_SIZE};

#[derive(Parser, Debug)]
#[command(name = "grades-ingest")]
#[command(about = "Streams uploaded grade CSVs into Postgres with live progress", long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the upload, progress and health endpoints
    Serve(ServeArgs),
    /// Ingest local CSV files and print progress events as JSON lines
    Import {
        #[arg(long, required = true, num_args = 1..)]
        csv: Vec<PathBuf>,
        #[command(flatten)]
        ingest: IngestArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Records per upsert statement and, in batched mode, per transaction
    #[arg(long, env = "INGEST_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_batch_size)]
    pub batch_size: usize,

    #[arg(long, env = "INGEST_INSERT_MODE", value_enum, default_value_t = InsertMode::Batched)]
    pub insert_mode: InsertMode,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

impl IngestArgs {
    pub fn upsert_options(&self) -> UpsertOptions {
        UpsertOptions {
            batch_size: self.batch_size,
            mode: self.insert_mode,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "HTTP_SERVER_PORT", default_value_t = 9000)]
    pub port: u16,

    #[arg(long, env = "HTTP_SERVER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// How long finished uploads stay visible on the progress endpoint
    #[arg(long, default_value_t = 3600)]
    pub progress_retention_secs: u64,

    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_secs: u64,

    #[arg(long, default_value_t = 1 << 30)]
    pub max_upload_bytes: usize,

    #[command(flatten)]
    pub ingest: IngestArgs,
}

impl ServeArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_batch_size(raw: &str) -> Result<usize, String> {
    let size: usize = raw
        .parse()
        .map_err(|err| format!("invalid batch size {raw:?}: {err}"))?;
    if size == 0 || size > MAX_ROWS_PER_STATEMENT {
        return Err(format!(
            "batch size must be between 1 and {MAX_ROWS_PER_STATEMENT}"
        ));
    }
    Ok(size)
}
