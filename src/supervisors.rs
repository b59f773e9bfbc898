//! Per-child supervisors. Each wraps a `ProcessRunner` with the correct
//! command line and any pre/post steps for one of the three long-lived
//! children: the runtime server (`spider`), the audio engine (`scsynth`),
//! and the BEAM-based IO server (`tau`).

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use base64::Engine;
use rand::RngCore;

use crate::config::AudioConfig;
use crate::constants::{BEAM_PID_REQUEST_INTERVAL, BEAM_PID_WAIT_TIMEOUT, PHX_SECRET_BYTES};
use crate::logging::Logger;
use crate::platform::{JackPrelude, Platform};
use crate::ports::{PortMap, PortName};
use crate::process::{self, ProcessRunner};
use crate::safe_exit::Terminable;
use crate::token::{BeamPidPromise, Token};

// ============================================================================
// Runtime-server supervisor (spider)
// ============================================================================

/// Supervises the runtime/language server. No pre/post steps, no restart:
/// its command line is fixed for the lifetime of the boot.
pub struct RuntimeServerSupervisor {
    runner: Arc<ProcessRunner>,
}

impl RuntimeServerSupervisor {
    /// Boot the runtime server: interpreter + entry script + `-u` + the seven
    /// ports it needs, in order, + the token.
    pub fn boot(
        interpreter: &str,
        entry_script: &str,
        ports: &PortMap,
        token: Token,
        log_path: Option<PathBuf>,
    ) -> Self {
        let mut command = Command::new(interpreter);
        command.arg(entry_script).arg("-u");
        for name in [
            PortName::SpiderListenToGui,
            PortName::SpiderSendToGui,
            PortName::Scsynth,
            PortName::ScsynthSend,
            PortName::OscCues,
            PortName::Tau,
            PortName::SpiderListenToTau,
        ] {
            command.arg(ports.get(name).to_string());
        }
        command.arg(token.to_string());

        let runner = Arc::new(ProcessRunner::spawn("spider", command, log_path));
        RuntimeServerSupervisor { runner }
    }

    pub fn process_runner(&self) -> Arc<ProcessRunner> {
        self.runner.clone()
    }

    pub fn kill(&self) {
        self.runner.kill();
    }
}

impl Terminable for RuntimeServerSupervisor {
    fn kill(&self) {
        RuntimeServerSupervisor::kill(self);
    }
}

// ============================================================================
// Audio-engine supervisor (scsynth)
// ============================================================================

/// Supervises the audio synthesis engine, including the Linux-family JACK
/// prelude (probe/spawn a local dummy-driver JACK daemon) and postlude
/// (PulseAudio<->JACK wiring, advisory and best-effort).
pub struct AudioEngineSupervisor {
    engine: Arc<ProcessRunner>,
    jack: Option<ProcessRunner>,
}

impl AudioEngineSupervisor {
    pub fn boot(
        platform: Arc<dyn Platform>,
        logger: Arc<Logger>,
        scsynth_path: &str,
        scsynth_port: u16,
        cfg: &AudioConfig,
        log_path: Option<PathBuf>,
    ) -> Self {
        let prelude = platform.ensure_jack(&logger);
        let jack = match prelude {
            JackPrelude::StartedLocal(runner) => Some(runner),
            JackPrelude::AlreadyRunning | JackPrelude::NotApplicable => None,
        };
        let we_started_jack = jack.is_some();

        let args = crate::config::build_scsynth_args(scsynth_port, cfg);
        let mut command = Command::new(scsynth_path);
        command.args(&args);
        let engine = Arc::new(ProcessRunner::spawn("scsynth", command, log_path));

        {
            let platform = platform.clone();
            let logger = logger.clone();
            thread::Builder::new()
                .name("scsynth-audio-routing".into())
                .spawn(move || platform.wire_audio_routing(&logger, we_started_jack))
                .expect("failed to spawn audio-routing thread");
        }

        AudioEngineSupervisor { engine, jack }
    }

    pub fn process_runner(&self) -> Arc<ProcessRunner> {
        self.engine.clone()
    }

    /// Kill the audio engine, then the local JACK daemon if the daemon
    /// started one.
    pub fn kill(&self) {
        self.engine.kill();
        if let Some(jack) = &self.jack {
            jack.kill();
        }
    }
}

impl Terminable for AudioEngineSupervisor {
    fn kill(&self) {
        AudioEngineSupervisor::kill(self);
    }
}

// ============================================================================
// BEAM-based IO-server supervisor (tau)
// ============================================================================

/// Fixed parameters the BEAM child's argument vector is rebuilt from on
/// every (re)spawn. The phx-secret and token are generated once and held
/// fixed across restarts, matching the Phoenix convention that the secret
/// key base and per-boot token identify one daemon lifetime, not one child
/// process lifetime (see DESIGN.md).
pub struct BeamChildSpec {
    pub launcher_script: String,
    pub cues_on: bool,
    pub udp_loopback_restricted: bool,
    pub midi_on: bool,
    pub link_on: bool,
    pub udp_cues_port: u16,
    pub api_port: u16,
    pub spider_port: u16,
    pub daemon_port: u16,
    pub log_path: String,
    pub midi_enabled: bool,
    pub link_enabled: bool,
    pub phx_port: u16,
    pub token: Token,
    pub environment: String,
}

fn generate_phx_secret() -> String {
    let mut bytes = [0u8; PHX_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn build_beam_args(spec: &BeamChildSpec, phx_secret: &str) -> Vec<String> {
    vec![
        bool_flag(spec.cues_on),
        bool_flag(spec.udp_loopback_restricted),
        bool_flag(spec.midi_on),
        bool_flag(spec.link_on),
        spec.udp_cues_port.to_string(),
        spec.api_port.to_string(),
        spec.spider_port.to_string(),
        spec.daemon_port.to_string(),
        spec.log_path.clone(),
        bool_flag(spec.midi_enabled),
        bool_flag(spec.link_enabled),
        spec.phx_port.to_string(),
        phx_secret.to_string(),
        spec.token.to_string(),
        spec.environment.clone(),
    ]
}

fn bool_flag(b: bool) -> String {
    if b {
        "1".to_string()
    } else {
        "0".to_string()
    }
}

struct BeamInner {
    runner: Arc<ProcessRunner>,
    pid_promise: Arc<BeamPidPromise>,
    request_cancel: Arc<AtomicBool>,
}

/// Supervises the BEAM-based IO server. `restart()` coalesces concurrent
/// requests: a restart already in flight causes later requests to return
/// immediately rather than queue.
pub struct BeamSupervisor {
    spec: BeamChildSpec,
    phx_secret: String,
    platform: Arc<dyn Platform>,
    logger: Arc<Logger>,
    log_path: Option<PathBuf>,
    inner: Mutex<BeamInner>,
    restarting: AtomicBool,
    restart_lock: Mutex<()>,
}

impl BeamSupervisor {
    pub fn boot(
        platform: Arc<dyn Platform>,
        logger: Arc<Logger>,
        spec: BeamChildSpec,
        log_path: Option<PathBuf>,
    ) -> Self {
        let phx_secret = generate_phx_secret();
        let inner = Self::spawn_child(&platform, &logger, &spec, &phx_secret, &log_path);
        BeamSupervisor {
            spec,
            phx_secret,
            platform,
            logger,
            log_path,
            inner: Mutex::new(inner),
            restarting: AtomicBool::new(false),
            restart_lock: Mutex::new(()),
        }
    }

    fn spawn_child(
        platform: &Arc<dyn Platform>,
        logger: &Arc<Logger>,
        spec: &BeamChildSpec,
        phx_secret: &str,
        log_path: &Option<PathBuf>,
    ) -> BeamInner {
        let args = build_beam_args(spec, phx_secret);
        let mut command = platform.beam_command(&spec.launcher_script);
        command.args(&args);
        let runner = Arc::new(ProcessRunner::spawn("tau", command, log_path.clone()));

        let pid_promise = Arc::new(BeamPidPromise::new());
        let request_cancel = Arc::new(AtomicBool::new(false));
        // `api_port` is tau's own listen port (the `tau` entry in the port
        // policy table); pid-requests are addressed there.
        spawn_pid_request_loop(
            spec.api_port,
            spec.token,
            pid_promise.clone(),
            request_cancel.clone(),
            logger.clone(),
        );

        BeamInner {
            runner,
            pid_promise,
            request_cancel,
        }
    }

    pub fn process_runner(&self) -> Arc<ProcessRunner> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .runner
            .clone()
    }

    /// The pid promise for the currently running child, used by the control
    /// server to fulfill `/tau/pid`.
    pub fn pid_promise(&self) -> Arc<BeamPidPromise> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pid_promise
            .clone()
    }

    fn kill_inner(inner: &BeamInner, logger: &Logger) {
        inner.request_cancel.store(true, Ordering::SeqCst);
        // Waiting for a self-reported pid only makes sense while the child
        // is actually still running; a child that already exited will never
        // call back, so there is nothing to wait for.
        if inner.runner.liveness() {
            if let Some(pid) = inner.pid_promise.wait(BEAM_PID_WAIT_TIMEOUT) {
                if process::supports_signals() {
                    #[cfg(unix)]
                    {
                        let _ = process::signal::send_sigterm(pid);
                    }
                }
            } else {
                logger.log("tau: proceeding with shutdown without a self-reported pid");
            }
        }
        inner.runner.kill();
    }

    /// Final teardown: stop the pid-request loop and kill the current child.
    pub fn kill(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::kill_inner(&inner, &self.logger);
    }

    /// Request a restart. Concurrent requests collapse to at most one
    /// in-flight restart.
    pub fn restart(&self) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            self.logger
                .log("tau: restart already in progress; request coalesced");
            return;
        }
        let _guard = self.restart_lock.lock().unwrap_or_else(|e| e.into_inner());

        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Self::kill_inner(&inner, &self.logger);
        }

        let new_inner = Self::spawn_child(
            &self.platform,
            &self.logger,
            &self.spec,
            &self.phx_secret,
            &self.log_path,
        );
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            *inner = new_inner;
        }

        self.restarting.store(false, Ordering::SeqCst);
    }
}

impl Terminable for BeamSupervisor {
    fn kill(&self) {
        BeamSupervisor::kill(self);
    }
}

/// Background loop emitting `"/send-pid-to-daemon", token` to the BEAM
/// child's `tau` listen port every second until it self-reports its pid (or
/// the supervisor cancels the loop, e.g. on restart/teardown).
fn spawn_pid_request_loop(
    tau_port: u16,
    token: Token,
    pid_promise: Arc<BeamPidPromise>,
    cancel: Arc<AtomicBool>,
    logger: Arc<Logger>,
) {
    thread::Builder::new()
        .name("tau-pid-request".into())
        .spawn(move || {
            let socket = match std::net::UdpSocket::bind("127.0.0.1:0") {
                Ok(s) => s,
                Err(e) => {
                    logger.error("tau pid-request socket", &e);
                    return;
                }
            };
            let dest = std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, tau_port);

            let packet = rosc::OscPacket::Message(rosc::OscMessage {
                addr: "/send-pid-to-daemon".to_string(),
                args: vec![rosc::OscType::Int(token.value())],
            });
            let Ok(encoded) = rosc::encoder::encode(&packet) else {
                logger.log("tau: failed to encode pid-request packet");
                return;
            };

            while !cancel.load(Ordering::SeqCst) && pid_promise.wait(std::time::Duration::ZERO).is_none() {
                let _ = socket.send_to(&encoded, dest);
                thread::sleep(BEAM_PID_REQUEST_INTERVAL);
            }
        })
        .expect("failed to spawn tau pid-request thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::UnixDesktop;

    fn fresh_logger() -> Arc<Logger> {
        Arc::new(Logger::open(std::env::temp_dir().join(format!(
            "sonic_daemon_supervisors_test_{}_{}.log",
            std::process::id(),
            rand::random::<u64>()
        ))))
    }

    #[test]
    fn test_build_beam_args_has_fifteen_items_in_order() {
        let spec = BeamChildSpec {
            launcher_script: "launcher.sh".to_string(),
            cues_on: true,
            udp_loopback_restricted: false,
            midi_on: true,
            link_on: false,
            udp_cues_port: 4560,
            api_port: 4001,
            spider_port: 4002,
            daemon_port: 4003,
            log_path: "/tmp/beam.log".to_string(),
            midi_enabled: true,
            link_enabled: false,
            phx_port: 4004,
            token: Token::from_raw(42),
            environment: "dev".to_string(),
        };
        let args = build_beam_args(&spec, "c2VjcmV0");
        assert_eq!(args.len(), 15);
        assert_eq!(args[0], "1");
        assert_eq!(args[4], "4560");
        assert_eq!(args[12], "c2VjcmV0");
        assert_eq!(args[13], "42");
        assert_eq!(args[14], "dev");
    }

    #[test]
    fn test_runtime_server_supervisor_builds_expected_command() {
        let ports = crate::ports::allocate().unwrap();
        let token = Token::generate();
        let sup = RuntimeServerSupervisor::boot("/bin/true", "entry.rb", &ports, token, None);
        assert!(sup.process_runner().pid().is_some() || !sup.process_runner().liveness());
        sup.kill();
    }

    /// `SafeExit` registers supervisors as `Arc<dyn Terminable>`, not raw
    /// `ProcessRunner`s — each supervisor's own `kill()` must be reachable
    /// through the trait object, not just the wrapped runner's.
    #[test]
    fn test_beam_supervisor_kill_is_reachable_through_terminable_trait_object() {
        let spec = BeamChildSpec {
            launcher_script: "true".to_string(),
            cues_on: true,
            udp_loopback_restricted: true,
            midi_on: false,
            link_on: false,
            udp_cues_port: 4560,
            api_port: 4001,
            spider_port: 4002,
            daemon_port: 4003,
            log_path: "/tmp/beam.log".to_string(),
            midi_enabled: false,
            link_enabled: false,
            phx_port: 4004,
            token: Token::generate(),
            environment: "dev".to_string(),
        };
        let sup: Arc<dyn crate::safe_exit::Terminable> = Arc::new(BeamSupervisor::boot(
            Arc::new(UnixDesktop),
            fresh_logger(),
            spec,
            None,
        ));
        sup.kill();
    }

    #[test]
    fn test_beam_restart_coalesces_concurrent_requests() {
        let spec = BeamChildSpec {
            launcher_script: "true".to_string(),
            cues_on: true,
            udp_loopback_restricted: true,
            midi_on: false,
            link_on: false,
            udp_cues_port: 4560,
            api_port: 4001,
            spider_port: 4002,
            daemon_port: 4003,
            log_path: "/tmp/beam.log".to_string(),
            midi_enabled: false,
            link_enabled: false,
            phx_port: 4004,
            token: Token::generate(),
            environment: "dev".to_string(),
        };
        let sup = Arc::new(BeamSupervisor::boot(
            Arc::new(UnixDesktop),
            fresh_logger(),
            spec,
            None,
        ));

        let s1 = sup.clone();
        let s2 = sup.clone();
        let h1 = thread::spawn(move || s1.restart());
        let h2 = thread::spawn(move || s2.restart());
        h1.join().unwrap();
        h2.join().unwrap();

        sup.kill();
    }
}
