//! AIMOS CLI: JSON-emitting front end to the memory core.

mod cli;
mod cmd;

use clap::Parser;
use cli::Cli;
use serde_json::json;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();
    aimos_memory::metrics::init();

    match cmd::run(cli) {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("{}", json!({ "error": "serialization_error", "message": e.to_string() }));
                std::process::exit(1);
            }
        },
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "Command failed");
            eprintln!("{}", json!({ "error": e.kind(), "message": e.to_string() }));
            std::process::exit(1);
        }
    }
}
