//! Orchestrator: wires every other component together in the strict
//! ten-step boot sequence and blocks the main task on the exit promise
//! until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::info;
use serde::Serialize;

use crate::config::{self, AudioConfig, RuntimeConfig};
use crate::constants::BEAM_PID_WAIT_TIMEOUT;
use crate::control::ControlServer;
use crate::exit_promise::ExitPromise;
use crate::killswitch::KillSwitch;
use crate::logging::{self, Logger};
use crate::ports::{self, PortName};
use crate::safe_exit::{install_panic_hook, SafeExit};
use crate::supervisors::{AudioEngineSupervisor, BeamChildSpec, BeamSupervisor, RuntimeServerSupervisor};
use crate::token::Token;
use crate::{platform, Args};

/// Run the full boot sequence. Returns `Ok(())` on an orderly exit; an `Err`
/// means a fatal condition occurred before (or shortly after) the control
/// surface could be opened, and `main` should exit with a nonzero status.
pub fn run(args: &Args) -> Result<()> {
    // --- Step 1: open the daemon log file. ---
    let log_dir: PathBuf = args
        .log_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(logging::log_dir);
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    let logger = Arc::new(Logger::open(log_dir.join("daemon.log")));

    // --- Step 2: attempt log rotation. Never fatal. ---
    // Must run before the first write so the previous run's tail doesn't end
    // up migrated into this run's live log before being truncated away.
    logging::rotate_logs(&log_dir);
    logger.log("daemon starting up");

    let config_dir: PathBuf = args
        .config_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(logging::config_dir);

    let exit = Arc::new(ExitPromise::new());
    let safe_exit = SafeExit::new(logger.clone(), exit.clone());
    install_panic_hook(safe_exit.clone());

    match boot(args, &log_dir, &config_dir, logger.clone(), exit.clone(), safe_exit.clone()) {
        Ok(()) => {
            // --- Step 10: block on the exit promise. ---
            exit.wait();
            safe_exit.trigger();
            Ok(())
        }
        Err(e) => {
            logger.error("fatal boot failure", &e);
            safe_exit.trigger();
            Err(e)
        }
    }
}

/// Steps 3-9 of the boot sequence. Any fatal error here triggers SafeExit via
/// the caller and is surfaced as a nonzero exit status.
fn boot(
    args: &Args,
    log_dir: &PathBuf,
    config_dir: &PathBuf,
    logger: Arc<Logger>,
    exit: Arc<ExitPromise>,
    safe_exit: Arc<SafeExit>,
) -> Result<()> {
    // --- Step 3: discover ports. Failure is fatal. ---
    let port_map = ports::allocate().context("port allocation failed")?;
    logger.log("ports allocated");

    let token = Token::generate();
    let platform = platform::detect_platform();

    // --- Step 4: construct the kill switch, armed at t + 40s. ---
    let kill_switch = Arc::new(KillSwitch::start(logger.clone(), exit.clone()));

    let runtime_cfg: RuntimeConfig = {
        let mut cfg = config::load_runtime_config(&config_dir.join("runtime.toml"));
        config::apply_environment_override(&mut cfg);
        cfg
    };
    let audio_cfg: AudioConfig = config::load_audio_config(&config_dir.join("audio.toml"));

    // --- Step 5: boot the BEAM child and wait for its self-reported pid. ---
    let beam_spec = BeamChildSpec {
        launcher_script: beam_launcher_script(args),
        cues_on: true,
        udp_loopback_restricted: true,
        midi_on: true,
        link_on: true,
        udp_cues_port: port_map.get(PortName::OscCues),
        api_port: port_map.get(PortName::Tau),
        spider_port: port_map.get(PortName::Spider),
        daemon_port: port_map.get(PortName::Daemon),
        log_path: log_dir.join("beam-child.log").to_string_lossy().into_owned(),
        midi_enabled: true,
        link_enabled: true,
        phx_port: port_map.get(PortName::Phx),
        token,
        environment: runtime_cfg.environment.clone(),
    };
    let beam = Arc::new(BeamSupervisor::boot(
        platform.clone(),
        logger.clone(),
        beam_spec,
        Some(log_dir.join("beam-child.log")),
    ));
    safe_exit.register(beam.clone());
    let beam_pid = beam.pid_promise().wait(BEAM_PID_WAIT_TIMEOUT);
    match beam_pid {
        Some(pid) => logger.log(&format!("BEAM child reported pid {pid}")),
        None => logger.log("BEAM child did not report a pid within the timeout; continuing"),
    }
    if !beam.process_runner().liveness() {
        return Err(anyhow!("BEAM child failed to start"));
    }

    // --- Step 6: start the control server. ---
    let control_server = Arc::new(
        ControlServer::start(
            port_map.get(PortName::Daemon),
            token,
            logger.clone(),
            kill_switch.clone(),
            exit.clone(),
            beam.clone(),
        )
        .context("failed to start control server")?,
    );
    safe_exit.register_control_server(control_server);

    // --- Step 7: emit the stdout handshake line and flush. ---
    println!(
        "{} {} {} {} {} {} {} {}",
        port_map.get(PortName::Daemon),
        port_map.get(PortName::GuiListenToSpider),
        port_map.get(PortName::GuiSendToSpider),
        port_map.get(PortName::Scsynth),
        port_map.get(PortName::OscCues),
        port_map.get(PortName::Tau),
        port_map.get(PortName::Phx),
        token,
    );
    use std::io::Write;
    std::io::stdout().flush().context("failed to flush stdout handshake")?;
    logger.log("stdout handshake emitted");
    write_handshake_record(log_dir, &port_map, token);

    // --- Step 8: boot the audio engine. ---
    let audio = Arc::new(AudioEngineSupervisor::boot(
        platform.clone(),
        logger.clone(),
        &scsynth_path(args),
        port_map.get(PortName::Scsynth),
        &audio_cfg,
        Some(log_dir.join("audio-engine.log")),
    ));
    safe_exit.register(audio);

    // --- Step 9: boot the runtime server. ---
    let spider = Arc::new(RuntimeServerSupervisor::boot(
        &spider_interpreter(args),
        &spider_entry_script(args),
        &port_map,
        token,
        Some(log_dir.join("runtime-server.log")),
    ));
    safe_exit.register(spider);

    info!("boot sequence complete");
    Ok(())
}

/// Diagnostic JSON record of the resolved port map and token, written
/// alongside the stdout handshake for log inspection. Never read back by the
/// daemon itself; the stdout handshake line is the sole machine-readable
/// contract with the parent process.
#[derive(Serialize)]
struct HandshakeRecord {
    daemon: u16,
    gui_listen_to_spider: u16,
    gui_send_to_spider: u16,
    scsynth: u16,
    osc_cues: u16,
    tau: u16,
    phx: u16,
    token: i32,
}

fn write_handshake_record(log_dir: &PathBuf, port_map: &ports::PortMap, token: Token) {
    let record = HandshakeRecord {
        daemon: port_map.get(PortName::Daemon),
        gui_listen_to_spider: port_map.get(PortName::GuiListenToSpider),
        gui_send_to_spider: port_map.get(PortName::GuiSendToSpider),
        scsynth: port_map.get(PortName::Scsynth),
        osc_cues: port_map.get(PortName::OscCues),
        tau: port_map.get(PortName::Tau),
        phx: port_map.get(PortName::Phx),
        token: token.value(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&record) {
        let _ = std::fs::write(log_dir.join("handshake.json"), json);
    }
}

fn beam_launcher_script(args: &Args) -> String {
    args.beam_launcher_path
        .clone()
        .unwrap_or_else(|| "bin/daemon".to_string())
}

fn scsynth_path(args: &Args) -> String {
    args.scsynth_path.clone().unwrap_or_else(|| "scsynth".to_string())
}

fn spider_interpreter(args: &Args) -> String {
    args.spider_interpreter
        .clone()
        .unwrap_or_else(|| "ruby".to_string())
}

fn spider_entry_script(args: &Args) -> String {
    args.spider_entry_path
        .clone()
        .unwrap_or_else(|| "spider-server.rb".to_string())
}
