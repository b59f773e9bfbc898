//! sonic_daemon: boot daemon and process supervisor entry point.

use anyhow::Result;
use clap::Parser;

use sonic_daemon::orchestrator;
use sonic_daemon::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose {
        "sonic_daemon=debug"
    } else {
        "sonic_daemon=info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", default_level))
        .format_target(false)
        .format_timestamp_millis()
        .init();

    match orchestrator::run(&args) {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("sonic_daemon: fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
