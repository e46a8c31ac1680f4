//! # Main — CLI Entry Point
//!
//! Routes subcommands to the coordinator and worker entry points. Handles
//! the shared concerns: env loading, structured logging, and bus selection
//! (PostgreSQL when `DATABASE_URL` is configured, in-process otherwise).

mod cli;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "loadreach",
    about = "Distributed database-benchmarking harness"
)]
struct Cli {
    /// PostgreSQL coordination store (or set DATABASE_URL). Without it,
    /// `run` executes single-process over the in-memory bus.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and wait for its terminal status
    Run {
        /// Path to the JSON scenario file
        #[arg(long)]
        scenario: PathBuf,
        /// Use a caller-chosen run id instead of a generated one
        #[arg(long)]
        run_id: Option<Uuid>,
        /// Do not spawn local workers; wait for `worker` processes to join
        #[arg(long)]
        external_workers: bool,
    },
    /// Request a graceful stop (or hard abort) of a running benchmark
    Stop {
        #[arg(long)]
        run_id: Uuid,
        /// Cancel in-flight operations instead of draining them
        #[arg(long)]
        abort: bool,
    },
    /// Print the current run status as JSON
    Status {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Join a run as a worker process (distributed mode)
    Worker {
        #[arg(long)]
        run_id: Uuid,
        /// Worker identity; defaults to hostname-pid
        #[arg(long)]
        worker_id: Option<String>,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for fleet deployments,
    // human-readable stderr otherwise.
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let database_url = cli.database_url.as_deref();

    let result = match &cli.command {
        Commands::Run {
            scenario,
            run_id,
            external_workers,
        } => cli::run_benchmark(database_url, scenario, *run_id, *external_workers),
        Commands::Stop { run_id, abort } => cli::stop_run(database_url, *run_id, *abort),
        Commands::Status { run_id } => cli::run_status(database_url, *run_id),
        Commands::Worker { run_id, worker_id } => {
            cli::run_worker(database_url, *run_id, worker_id.clone())
        }
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
