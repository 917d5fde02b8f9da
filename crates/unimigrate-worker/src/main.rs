//! Migration worker binary.
//!
//! Hosts the pipeline engine behind a small HTTP API: `GET /health`,
//! `POST /migrate`, `POST /test-connection`. Adapter credentials arrive
//! per request and are never read from the process environment.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};

use unimigrate::AdapterCatalog;
use unimigrate_worker::app;

#[derive(Parser)]
#[command(name = "unimigrate-worker")]
#[command(about = "Universal migration worker")]
#[command(version)]
struct Cli {
    /// Port to listen on (falls back to WORKER_PORT, then 5011)
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind (falls back to WORKER_HOST, then 0.0.0.0)
    #[arg(long)]
    host: Option<String>,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

fn init_logging(format: &str, verbosity: &str) {
    let level = match verbosity {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_format, &cli.verbosity);

    let port = cli
        .port
        .or_else(|| {
            std::env::var("WORKER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
        })
        .unwrap_or(5011);
    let host = cli
        .host
        .or_else(|| std::env::var("WORKER_HOST").ok())
        .unwrap_or_else(|| "0.0.0.0".to_string());

    let catalog = Arc::new(AdapterCatalog::with_builtins());
    info!("Available sources: {:?}", catalog.source_keys());
    info!("Available destinations: {:?}", catalog.destination_keys());

    let app = app::router(catalog);
    let addr = format!("{}:{}", host, port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Migration worker listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
