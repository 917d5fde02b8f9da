//! Orchestrator binary: operation store, scheduler, supervisor, HTTP API.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};

use unimigrate_orchestrator::{
    api, Executor, OrchestratorConfig, PgOperationStore, Scheduler, WorkerSupervisor,
};

#[derive(Parser)]
#[command(name = "unimigrate-orchestrator")]
#[command(about = "Migration orchestrator")]
#[command(version)]
struct Cli {
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

    let config = OrchestratorConfig::from_env();
    info!("Worker endpoint: {}", config.worker_health_url());

    let store = match PgOperationStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store) as Arc<dyn unimigrate_orchestrator::OperationStore>,
        Err(e) => {
            error!("Could not open operation store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Arc::new(WorkerSupervisor::new(
        config.worker_health_url(),
        config.worker_launch_command.clone(),
        config.worker_startup_timeout,
    ));
    let executor = Executor::new(
        Arc::clone(&store),
        supervisor,
        config.worker_migrate_url(),
        config.migrate_http_timeout,
    );

    Scheduler::new(Arc::clone(&store), executor.clone(), config.scheduler_interval).spawn();

    let app = api::router(store, executor);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Orchestrator listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
