//! banjo binary
//!
//! Run with: cargo run
//!
//! For help: cargo run -- --help

use banjo::{run_with_cli, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let result = run_with_cli(&cli).await;

    if let Err(e) = result {
        // Output error to stderr (the protocol owns stdout in agent mode)
        eprintln!("Error: {}", e);

        // If running in interactive mode, show more details
        if atty::is(atty::Stream::Stdin) {
            eprintln!("\nFor debugging, run with --diagnostic to log to a file.");
            eprintln!("Or use -v/-vv/-vvv for more verbose logging.");
        }

        std::process::exit(1);
    }

    Ok(())
}
