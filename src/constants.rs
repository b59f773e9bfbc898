//! Centralized constants for sonic_daemon timing, networking, and protocol values.
//!
//! This module collects the timing, network, and protocol constants used throughout
//! the daemon to avoid magic numbers scattered across the codebase.

use std::time::Duration;

// ============================================================================
// Port Allocation
// ============================================================================

/// Lower bound of the ephemeral port range dynamic ports are drawn from.
pub const DYNAMIC_PORT_LOW: u16 = 29153;

/// Upper bound of the ephemeral port range (inclusive).
pub const DYNAMIC_PORT_HIGH: u16 = 65535;

/// Upper bound of the random seed used to pick the starting point of a dynamic scan.
/// Kept below DYNAMIC_PORT_HIGH so the scan always has room to roll forward.
pub const DYNAMIC_SEED_HIGH: u16 = 39152;

/// Fixed default port for the OSC cues bus (`osc-cues`).
pub const OSC_CUES_PORT: u16 = 4560;

// ============================================================================
// Process Termination
// ============================================================================

/// Grace period given to a child after a polite terminate signal before escalating.
pub const GRACEFUL_TERM_GRACE: Duration = Duration::from_secs(5);

/// Grace period given to a child after a forceful terminate signal.
pub const FORCEFUL_TERM_GRACE: Duration = Duration::from_secs(5);

/// Interval at which liveness is polled while waiting out a termination grace period.
pub const TERM_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Kill Switch
// ============================================================================

/// Startup grace period during which the kill switch cannot fire.
pub const KILL_SWITCH_STARTUP_GRACE: Duration = Duration::from_secs(40);

/// Interval between kill-switch liveness checks once armed.
pub const KILL_SWITCH_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Number of consecutive silent ticks tolerated before the kill switch fires.
/// The switch fires once the failure counter exceeds this value.
pub const KILL_SWITCH_MAX_MISSED_TICKS: u32 = 4;

// ============================================================================
// BEAM Child (tau)
// ============================================================================

/// Maximum time to wait for the BEAM child to self-report its OS pid.
pub const BEAM_PID_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between pid-request retries sent to the BEAM child.
pub const BEAM_PID_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Length, in raw bytes, of the random phx-secret before base64 encoding.
pub const PHX_SECRET_BYTES: usize = 64;

// ============================================================================
// Audio Engine (scsynth) JACK Prelude
// ============================================================================

/// Delay after starting scsynth before wiring up PulseAudio<->JACK loopback modules.
pub const JACK_WIRING_DELAY: Duration = Duration::from_secs(5);

/// Sample rate used for the dummy JACK driver the daemon starts when no JACK server is found.
pub const JACK_DUMMY_SAMPLE_RATE: u32 = 48_000;

/// Buffer size (frames) used for the dummy JACK driver.
pub const JACK_DUMMY_BUFFER_FRAMES: u32 = 1024;

// ============================================================================
// Log Rotation
// ============================================================================

/// Maximum number of timestamped history snapshots retained under `history/`.
pub const MAX_LOG_HISTORY: usize = 10;

/// The six canonical log files truncated on every boot rotation.
pub const CANONICAL_LOG_FILES: [&str; 6] = [
    "daemon.log",
    "debug.log",
    "gui.log",
    "audio-engine.log",
    "runtime-server.log",
    "beam-child.log",
];

// ============================================================================
// Control Server
// ============================================================================

/// Read timeout for the control server's UDP socket, letting the receive loop
/// periodically check for a shutdown request without blocking forever.
pub const CONTROL_SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum size of an inbound OSC datagram the control server will accept.
pub const CONTROL_SOCKET_BUFFER_SIZE: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_port_range_is_well_formed() {
        assert!(DYNAMIC_PORT_LOW < DYNAMIC_SEED_HIGH);
        assert!(DYNAMIC_SEED_HIGH < DYNAMIC_PORT_HIGH);
    }

    #[test]
    fn test_kill_switch_timeline_is_roughly_fifty_seconds() {
        let total = KILL_SWITCH_TICK_INTERVAL * (KILL_SWITCH_MAX_MISSED_TICKS + 1);
        assert_eq!(total, Duration::from_secs(50));
    }

    #[test]
    fn test_canonical_log_files_count() {
        assert_eq!(CANONICAL_LOG_FILES.len(), 6);
    }
}
