//! sonic_daemon: a boot daemon and process supervisor for a multi-process
//! live-coding music environment.
//!
//! It launches and keeps alive three long-lived child processes — an audio
//! synthesis engine (`scsynth`), a language/runtime server (`spider`), and a
//! BEAM-based IO server (`tau`) — after computing a consistent set of free
//! UDP ports, reading user configuration files, and establishing a remote
//! kill switch that guarantees all children terminate when the controlling
//! front-end goes away or crashes.
//!
//! # Modules
//!
//! - [`constants`]: timing, network, and protocol constants
//! - [`logging`]: the daemon's own log file, timestamping, and log rotation
//! - [`ports`]: `PortAllocator`, computing the named port map
//! - [`config`]: `ConfigLoader`, parsing the audio and runtime config files
//! - [`process`]: `ProcessRunner`, spawn/tee/track/terminate for one child
//! - [`supervisors`]: the three per-child supervisors
//! - [`platform`]: platform-specific JACK prelude/postlude and shell wrapping
//! - [`token`]: the per-boot auth token and the BEAM pid promise
//! - [`exit_promise`]: the single-shot shutdown signal
//! - [`killswitch`]: the watchdog timer
//! - [`safe_exit`]: the idempotent shutdown guard
//! - [`control`]: the UDP control server
//! - [`orchestrator`]: wires everything together in the boot sequence

use clap::Parser;

pub mod config;
pub mod constants;
pub mod control;
pub mod exit_promise;
pub mod killswitch;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod ports;
pub mod process;
pub mod safe_exit;
pub mod supervisors;
pub mod token;

/// sonic_daemon's command-line surface, shared between `main.rs` and the
/// orchestrator.
#[derive(Parser, Debug)]
#[command(name = "sonic_daemon", version, about = "Boot daemon and process supervisor for a live-coding music environment")]
pub struct Args {
    /// Directory to write the daemon's log files into (overrides
    /// `SONIC_DAEMON_LOG_DIR` and the platform temp dir default).
    #[arg(long)]
    pub log_path: Option<String>,

    /// Directory to read the audio/runtime config files from (overrides
    /// `SONIC_DAEMON_CONFIG_DIR` and the platform temp dir default).
    #[arg(long)]
    pub config_path: Option<String>,

    /// Raise the default log level to debug.
    #[arg(long)]
    pub verbose: bool,

    /// Path to the scsynth executable (overrides `PATH` lookup).
    #[arg(long)]
    pub scsynth_path: Option<String>,

    /// Path to the runtime-server interpreter (e.g. ruby).
    #[arg(long)]
    pub spider_interpreter: Option<String>,

    /// Path to the runtime-server entry script.
    #[arg(long)]
    pub spider_entry_path: Option<String>,

    /// Path to the BEAM child's launcher script.
    #[arg(long)]
    pub beam_launcher_path: Option<String>,
}
