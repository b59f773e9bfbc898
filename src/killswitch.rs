//! KillSwitch: a watchdog timer that arms on start, resets on keep-alive,
//! and fires after a timeout, delivering the process's ExitPromise exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::info;

use crate::constants::{
    KILL_SWITCH_MAX_MISSED_TICKS, KILL_SWITCH_STARTUP_GRACE, KILL_SWITCH_TICK_INTERVAL,
};
use crate::exit_promise::ExitPromise;
use crate::logging::Logger;

/// Transitions are monotonic toward `Fired`; once fired, a switch never resets.
#[derive(Debug, Clone, Copy)]
pub enum KillSwitchState {
    Armed,
    KeptAlive(Instant),
    Fired,
}

/// A watchdog that fires `exit` after `KILL_SWITCH_MAX_MISSED_TICKS`
/// consecutive silent ticks following a startup grace period.
pub struct KillSwitch {
    queue_tx: mpsc::Sender<()>,
    state: Arc<Mutex<KillSwitchState>>,
    cancel: Arc<AtomicBool>,
}

impl KillSwitch {
    /// Start the watchdog thread. `exit` is delivered (at most once, by
    /// ExitPromise's own guarantee) when the switch fires.
    pub fn start(logger: Arc<Logger>, exit: Arc<ExitPromise>) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let cancel = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(KillSwitchState::Armed));

        let cancel_bg = cancel.clone();
        let state_bg = state.clone();
        thread::Builder::new()
            .name("kill-switch".into())
            .spawn(move || {
                sleep_unless_cancelled(KILL_SWITCH_STARTUP_GRACE, &cancel_bg);
                if cancel_bg.load(Ordering::SeqCst) {
                    return;
                }

                let mut missed_ticks: u32 = 0;
                loop {
                    sleep_unless_cancelled(KILL_SWITCH_TICK_INTERVAL, &cancel_bg);
                    if cancel_bg.load(Ordering::SeqCst) {
                        return;
                    }

                    let ticked = drain_any(&rx);
                    if ticked {
                        missed_ticks = 0;
                        let mut s = state_bg.lock().unwrap_or_else(|e| e.into_inner());
                        *s = KillSwitchState::KeptAlive(Instant::now());
                    } else {
                        missed_ticks += 1;
                        if missed_ticks > KILL_SWITCH_MAX_MISSED_TICKS {
                            let mut s = state_bg.lock().unwrap_or_else(|e| e.into_inner());
                            *s = KillSwitchState::Fired;
                            drop(s);
                            logger.log("kill switch timed out");
                            info!("kill switch timed out; requesting shutdown");
                            exit.deliver();
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn kill-switch thread");

        KillSwitch {
            queue_tx: tx,
            state,
            cancel,
        }
    }

    /// Enqueue a keep-alive tick. Drained on the watcher's next check.
    pub fn keep_alive(&self) {
        let _ = self.queue_tx.send(());
    }

    /// Cancel the watcher. Only used in tests: the kill switch cannot be
    /// re-armed once fired, and production code has no other reason to
    /// deactivate it.
    pub fn deactivate(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> KillSwitchState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sleep in short slices so cancellation is observed promptly rather than
/// only after a full interval.
fn sleep_unless_cancelled(total: std::time::Duration, cancel: &AtomicBool) {
    const SLICE: std::time::Duration = std::time::Duration::from_millis(100);
    let mut remaining = total;
    while remaining > std::time::Duration::ZERO {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}

/// Drain the keep-alive queue, returning whether any tick was observed.
fn drain_any(rx: &mpsc::Receiver<()>) -> bool {
    let mut any = false;
    while rx.try_recv().is_ok() {
        any = true;
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deactivate_stops_the_watcher_before_firing() {
        let logger = Arc::new(Logger::open(
            std::env::temp_dir().join(format!("sonic_daemon_ks_test_{}.log", std::process::id())),
        ));
        let exit = Arc::new(ExitPromise::new());
        let switch = KillSwitch::start(logger, exit.clone());
        switch.deactivate();
        thread::sleep(Duration::from_millis(200));
        assert!(!exit.is_delivered());
    }

    #[test]
    fn test_keep_alive_is_queued_without_panicking() {
        let logger = Arc::new(Logger::open(
            std::env::temp_dir().join(format!("sonic_daemon_ks_test2_{}.log", std::process::id())),
        ));
        let exit = Arc::new(ExitPromise::new());
        let switch = KillSwitch::start(logger, exit);
        switch.keep_alive();
        switch.keep_alive();
        switch.deactivate();
    }
}
