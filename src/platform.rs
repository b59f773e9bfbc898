//! Platform abstraction for the audio-engine supervisor's JACK prelude and
//! the BEAM-child supervisor's shell-wrapping decision.
//!
//! Segregates the {unix-desktop, unix-arm-embedded, windows} variants behind
//! one small trait so supervisor code stays polymorphic over platform
//! instead of scattering `cfg(...)` blocks through the lifecycle logic.

use std::process::Command;
use std::sync::Arc;

use log::warn;

use crate::logging::Logger;
use crate::process::ProcessRunner;

/// Outcome of the audio-engine's pre-start JACK probe.
pub enum JackPrelude {
    /// No JACK involvement on this platform; nothing to wire up afterward.
    NotApplicable,
    /// A JACK server was already running; the daemon did not start one.
    AlreadyRunning,
    /// The daemon started a local JACK daemon with a dummy driver, and owns
    /// its lifecycle (it must be killed alongside scsynth).
    StartedLocal(ProcessRunner),
}

/// Platform-specific behavior the supervisors are polymorphic over.
pub trait Platform: Send + Sync {
    /// Probe for / start a local JACK server as scsynth's pre-start step.
    fn ensure_jack(&self, logger: &Logger) -> JackPrelude;

    /// Post-start side commands wiring PulseAudio<->JACK and scsynth's I/O
    /// to the system I/O. Advisory: failures are logged, never fatal.
    fn wire_audio_routing(&self, logger: &Logger, we_started_jack: bool);

    /// Whether the BEAM child should be invoked through a shell (`sh -c ...`)
    /// or the launcher script run directly.
    fn supports_shell(&self) -> bool;

    /// Build the command used to invoke the BEAM child's launcher script.
    fn beam_command(&self, launcher_script: &str) -> Command {
        if self.supports_shell() {
            let mut cmd = Command::new("sh");
            cmd.arg(launcher_script);
            cmd
        } else {
            Command::new(launcher_script)
        }
    }
}

/// Desktop Linux/BSD: the only variant that actually runs the JACK prelude
/// and PulseAudio<->JACK wiring scripts.
pub struct UnixDesktop;

impl Platform for UnixDesktop {
    fn ensure_jack(&self, logger: &Logger) -> JackPrelude {
        let running = Command::new("jack_lsp")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if running {
            logger.log("JACK server already running");
            return JackPrelude::AlreadyRunning;
        }

        logger.log("no JACK server found; starting local dummy-driver daemon");
        let mut command = Command::new("jackd");
        command
            .arg("-d")
            .arg("dummy")
            .arg("-r")
            .arg(crate::constants::JACK_DUMMY_SAMPLE_RATE.to_string())
            .arg("-p")
            .arg(crate::constants::JACK_DUMMY_BUFFER_FRAMES.to_string());
        JackPrelude::StartedLocal(ProcessRunner::spawn("jackd", command, None))
    }

    fn wire_audio_routing(&self, logger: &Logger, we_started_jack: bool) {
        std::thread::sleep(crate::constants::JACK_WIRING_DELAY);
        let script = if we_started_jack {
            "pulseaudio-jack-connect-dummy.sh"
        } else {
            "pulseaudio-jack-connect.sh"
        };
        match Command::new("sh").arg(script).status() {
            Ok(status) if status.success() => {
                logger.log(&format!("audio routing wired via {script}"));
            }
            Ok(status) => {
                warn!("{script} exited with {status}; audio routing may be incomplete");
            }
            Err(e) => {
                warn!("failed to run {script}: {e}");
            }
        }
    }

    fn supports_shell(&self) -> bool {
        true
    }
}

/// Embedded Linux on ARM (e.g. a Raspberry Pi image): same shell support as
/// desktop Linux, but skips the JACK prelude and PulseAudio wiring, which
/// assume a desktop audio stack that embedded images don't carry.
pub struct UnixArmEmbedded;

impl Platform for UnixArmEmbedded {
    fn ensure_jack(&self, _logger: &Logger) -> JackPrelude {
        JackPrelude::NotApplicable
    }

    fn wire_audio_routing(&self, _logger: &Logger, _we_started_jack: bool) {}

    fn supports_shell(&self) -> bool {
        true
    }
}

/// Windows: no JACK prelude, no shell — the launcher script is invoked
/// directly rather than wrapped.
pub struct Windows;

impl Platform for Windows {
    fn ensure_jack(&self, _logger: &Logger) -> JackPrelude {
        JackPrelude::NotApplicable
    }

    fn wire_audio_routing(&self, _logger: &Logger, _we_started_jack: bool) {}

    fn supports_shell(&self) -> bool {
        false
    }
}

/// Select the platform implementation for the current build target.
/// `SONIC_DAEMON_PLATFORM=arm-embedded` forces the embedded-Linux variant for
/// testing on desktop hardware; otherwise detection follows `cfg(target_os)`.
pub fn detect_platform() -> Arc<dyn Platform> {
    if std::env::var("SONIC_DAEMON_PLATFORM").as_deref() == Ok("arm-embedded") {
        return Arc::new(UnixArmEmbedded);
    }

    #[cfg(target_os = "windows")]
    {
        Arc::new(Windows)
    }
    #[cfg(all(unix, target_arch = "arm"))]
    {
        Arc::new(UnixArmEmbedded)
    }
    #[cfg(all(unix, not(target_arch = "arm")))]
    {
        Arc::new(UnixDesktop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_has_no_shell_support() {
        assert!(!Windows.supports_shell());
    }

    #[test]
    fn test_unix_desktop_has_shell_support() {
        assert!(UnixDesktop.supports_shell());
    }

    #[test]
    fn test_beam_command_direct_invocation_without_shell() {
        let cmd = Windows.beam_command("launcher.bat");
        assert_eq!(cmd.get_program(), "launcher.bat");
    }

    #[test]
    fn test_beam_command_shell_wrapped() {
        let cmd = UnixDesktop.beam_command("launcher.sh");
        assert_eq!(cmd.get_program(), "sh");
    }

    #[test]
    fn test_arm_embedded_skips_jack() {
        let logger = Logger::open(std::env::temp_dir().join(format!(
            "sonic_daemon_platform_test_{}.log",
            std::process::id()
        )));
        assert!(matches!(
            UnixArmEmbedded.ensure_jack(&logger),
            JackPrelude::NotApplicable
        ));
    }
}
