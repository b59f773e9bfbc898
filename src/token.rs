//! Token: the per-boot 32-bit authenticator for control messages, and
//! BeamPidPromise, the single-assignment slot the BEAM child's self-reported
//! pid is delivered into.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use rand::Rng;

/// A signed 32-bit integer chosen uniformly at random at startup; immutable
/// for the process lifetime; gates every authenticated control method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(i32);

impl Token {
    /// Draw a fresh token uniformly at random. Excludes `i32::MIN`: its
    /// absolute value has no positive `i32` counterpart, and callers compare
    /// tokens with plain `+`/`-` arithmetic that would otherwise overflow.
    pub fn generate() -> Self {
        Token(rand::thread_rng().gen_range(i32::MIN + 1..=i32::MAX))
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    /// Build a Token from a value parsed off the wire, for comparison against
    /// an inbound control message's token argument.
    pub fn from_raw(value: i32) -> Self {
        Token(value)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-assignment slot holding the OS pid of the BEAM-based child, as
/// reported by the child itself over the control channel. Fulfilling it
/// twice is a no-op: the second delivery is silently dropped.
pub struct BeamPidPromise {
    pid: Mutex<Option<u32>>,
    cvar: Condvar,
}

impl BeamPidPromise {
    pub fn new() -> Self {
        BeamPidPromise {
            pid: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }

    /// Fulfill the promise with `pid`. A second call is a no-op.
    pub fn fulfill(&self, pid: u32) {
        let mut slot = self.pid.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(pid);
            self.cvar.notify_all();
        }
    }

    /// Wait up to `timeout` for the pid to be reported, returning `None` on
    /// timeout so the caller can proceed without it.
    pub fn wait(&self, timeout: Duration) -> Option<u32> {
        let slot = self.pid.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, _timeout_result) = self
            .cvar
            .wait_timeout_while(slot, timeout, |pid| pid.is_none())
            .unwrap_or_else(|e| e.into_inner());
        *slot
    }
}

impl Default for BeamPidPromise {
    fn default() -> Self {
        Self::new()
    }
}
