//! SafeExit: an idempotent shutdown guard that runs the cleanup procedure
//! exactly once regardless of how exit is reached (normal return, explicit
//! exit request, or panic).

use std::panic;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::control::ControlServer;
use crate::exit_promise::ExitPromise;
use crate::logging::Logger;
use crate::process::ProcessRunner;

/// Anything whose `kill()` must run as part of the cleanup procedure. Plain
/// `ProcessRunner`s implement this directly; supervisors that wrap one or
/// more process runners with extra teardown steps (killing a local JACK
/// daemon alongside the audio engine, cancelling the pid-request loop and
/// signalling the BEAM child's self-reported real pid rather than its `sh`
/// wrapper) implement it too, so `SafeExit` always goes through the
/// supervisor's own `kill()` instead of reaching past it at a raw runner.
pub trait Terminable: Send + Sync {
    fn kill(&self);
}

impl Terminable for ProcessRunner {
    fn kill(&self) {
        ProcessRunner::kill(self);
    }
}

/// Guards the cleanup procedure with a fast boolean latch and a second lock
/// held for the cleanup's duration, so concurrent callers either see "already
/// done" and return immediately, or block until the in-flight cleanup
/// finishes (and then see "already done" too).
pub struct SafeExit {
    done: Mutex<bool>,
    in_progress: Mutex<()>,
    logger: Arc<Logger>,
    runners: Mutex<Vec<Arc<dyn Terminable>>>,
    control_server: Mutex<Option<Arc<ControlServer>>>,
    exit: Arc<ExitPromise>,
}

impl SafeExit {
    pub fn new(logger: Arc<Logger>, exit: Arc<ExitPromise>) -> Arc<Self> {
        Arc::new(SafeExit {
            done: Mutex::new(false),
            in_progress: Mutex::new(()),
            logger,
            runners: Mutex::new(Vec::new()),
            control_server: Mutex::new(None),
            exit,
        })
    }

    /// Register a child (or supervisor) whose `kill()` must be part of the
    /// cleanup procedure. Safe to call before `trigger`; has no effect after.
    pub fn register(&self, item: Arc<dyn Terminable>) {
        self.runners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
    }

    /// Register the control server so its receive loop is stopped as part of
    /// cleanup. Only one control server is ever registered per boot.
    pub fn register_control_server(&self, server: Arc<ControlServer>) {
        *self
            .control_server
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(server);
    }

    /// Run the cleanup procedure exactly once: close the log, spawn one
    /// termination task per child, join all, close the log file again, then
    /// deliver the exit promise.
    pub fn trigger(&self) {
        {
            let done = self.done.lock().unwrap_or_else(|e| e.into_inner());
            if *done {
                return;
            }
        }

        let _guard = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
            if *done {
                return;
            }
            *done = true;
        }

        self.logger.log("safe exit: running cleanup");
        self.logger.close();

        if let Some(server) = self
            .control_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            server.shutdown();
        }

        let runners = self
            .runners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let handles: Vec<_> = runners
            .into_iter()
            .map(|r| thread::spawn(move || r.kill()))
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        self.logger.close();
        self.exit.deliver();
    }

    pub fn has_run(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Install a process-wide panic hook that funnels any panic through the same
/// cleanup path as every other exit route.
pub fn install_panic_hook(safe_exit: Arc<SafeExit>) {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);
        safe_exit.logger.error("panic", &info);
        safe_exit.trigger();
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fresh_logger() -> Arc<Logger> {
        Arc::new(Logger::open(std::env::temp_dir().join(format!(
            "sonic_daemon_safe_exit_test_{}_{}.log",
            std::process::id(),
            rand::random::<u64>()
        ))))
    }

    #[test]
    fn test_cleanup_runs_exactly_once_across_concurrent_triggers() {
        let safe_exit = SafeExit::new(fresh_logger(), Arc::new(ExitPromise::new()));
        let mut command = Command::new("sleep");
        command.arg("60");
        safe_exit.register(Arc::new(ProcessRunner::spawn("child", command, None)));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let se = safe_exit.clone();
                thread::spawn(move || se.trigger())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(safe_exit.has_run());
        assert!(safe_exit.exit.is_delivered());
    }

    /// A `Terminable` that records how many times its own `kill()` ran,
    /// standing in for a supervisor whose `kill()` does more than terminate
    /// one raw process (e.g. also killing a locally-started JACK daemon, or
    /// signalling a child's self-reported pid).
    struct CountingTerminable(Arc<AtomicUsize>);

    impl Terminable for CountingTerminable {
        fn kill(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_trigger_calls_through_to_registered_terminable_not_just_a_raw_runner() {
        let safe_exit = SafeExit::new(fresh_logger(), Arc::new(ExitPromise::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        safe_exit.register(Arc::new(CountingTerminable(calls.clone())));

        safe_exit.trigger();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_after_completion_is_a_cheap_noop() {
        let safe_exit = SafeExit::new(fresh_logger(), Arc::new(ExitPromise::new()));
        safe_exit.trigger();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            safe_exit.trigger();
            calls.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(safe_exit.has_run());
    }
}
