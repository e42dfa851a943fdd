use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use robot_arm_control::config::DEFAULT_CONFIG_PATH;

/// Drive the robot arm from an interactive command prompt
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Robot arm configuration file (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log every wire frame
    #[arg(short, long)]
    verbose: bool,

    /// Extra attempts when a controller is not ready at startup
    #[arg(long, default_value_t = 0)]
    connect_retries: u32,
}

fn main() {
    let args = Args::parse();

    // Setup logging (RUST_LOG overrides the default level)
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse().unwrap()))
        .init(); // installs the subscriber globally

    if let Err(e) = robot_arm_control::runtime::run(&args.config, args.connect_retries) {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
