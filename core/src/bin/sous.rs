//! Sous CLI
//!
//! Runs recipes, inspects the operation registry, manages persisted pool
//! settings and benchmarks the worker pool.

use sous_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
