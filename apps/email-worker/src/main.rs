//! Email Worker Service (RabbitMQ)
//!
//! Binary entry point. `email-worker consume` runs the worker,
//! `email-worker publish` submits a job.

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = email_worker::Cli::parse();
    if let Err(e) = email_worker::run(cli).await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
