//! coldvm CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

/// Cold VM Manager - QEMU virtual machine launcher
#[derive(Parser, Debug)]
#[command(name = "coldvm")]
#[command(about = "Cold VM Manager - QEMU virtual machine launcher")]
#[command(version)]
#[command(after_help = cli::boot::DEFAULTS_HELP)]
struct Cli {
    #[command(flatten)]
    boot: cli::boot::BootCmd,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = coldvm::VERSION, "starting coldvm");

    if let Err(e) = cli.boot.run() {
        coldvm::console::error(e.to_string());
        eprintln!("\n{} Failed to start Cold VM!\n", coldvm::console::ERROR);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("coldvm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
