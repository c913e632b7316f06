//! inouttraffic CLI: bring up multi-FPGA boards and drive test traffic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

mod cli;

/// Shared shutdown flag, cleared by the Ctrl+C handler.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser)]
#[command(
    name = "inouttraffic-cli",
    version,
    about = "Bring up ZTEX multi-FPGA boards and run echo traffic"
)]
struct Args {
    /// Output as JSON (for devices, check, echo, config)
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: cli::Command,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();

    ctrlc::set_handler(move || {
        RUNNING.store(false, Ordering::SeqCst);
    })
    .ok();

    if let Err(e) = cli::run(args.command, args.json, args.config.as_deref()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
