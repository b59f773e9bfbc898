//! ProcessRunner: spawns a child, tees its combined stdout+stderr to a log
//! file, tracks liveness, and supports graceful-then-forceful termination.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::constants::{FORCEFUL_TERM_GRACE, GRACEFUL_TERM_GRACE, TERM_POLL_INTERVAL};

// ============================================================================
// Safe Signal Wrapper
// ============================================================================

/// Safe wrappers around libc signal operations.
/// All unsafe code is isolated here with SAFETY documentation.
#[cfg(unix)]
pub mod signal {
    use std::io;

    /// Check if a process exists (signal 0 is POSIX standard).
    pub fn process_exists(pid: u32) -> bool {
        // SAFETY: kill(pid, 0) only checks existence, no signal sent.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    /// Send SIGTERM for graceful termination. "No such process" counts as
    /// success: the target is already gone, which is the desired end state.
    pub fn send_sigterm(pid: u32) -> io::Result<()> {
        send_signal(pid, libc::SIGTERM)
    }

    /// Send SIGKILL for immediate termination.
    pub fn send_sigkill(pid: u32) -> io::Result<()> {
        send_signal(pid, libc::SIGKILL)
    }

    fn send_signal(pid: u32, sig: i32) -> io::Result<()> {
        // SAFETY: signum is one of the fixed constants above; pid is a plain integer.
        let result = unsafe { libc::kill(pid as i32, sig) };
        if result == 0 {
            Ok(())
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

/// Whether this platform supports signal-based termination at all.
/// On platforms without it, only forceful (`Child::kill`) termination is attempted.
pub const fn supports_signals() -> bool {
    cfg!(unix)
}

// ============================================================================
// ProcessRunner
// ============================================================================

/// A spawned child process with pipe-to-log teeing and graceful-then-forceful
/// termination. All failures (spawn, log open, signal delivery) are logged
/// and swallowed: a ProcessRunner that never successfully spawned is simply
/// "never alive", and every later call is a no-op.
pub struct ProcessRunner {
    label: String,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    alive: AtomicBool,
    log_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessRunner {
    /// Spawn `command`, teeing its stdout and stderr into `log_path` (if given)
    /// one line at a time. Spawn failures are logged and leave the runner in
    /// a "never alive" state so `kill`/`wait` are harmless no-ops.
    pub fn spawn(label: impl Into<String>, mut command: Command, log_path: Option<PathBuf>) -> Self {
        let label = label.into();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("{label}: failed to spawn: {e}");
                return ProcessRunner {
                    label,
                    child: Mutex::new(None),
                    pid: AtomicU32::new(0),
                    alive: AtomicBool::new(false),
                    log_threads: Mutex::new(Vec::new()),
                };
            }
        };

        let pid = child.id();
        debug!("{label}: spawned pid={pid}");

        let log_file = log_path.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| warn!("{label}: failed to open log {path:?}: {e}"))
                .ok()
        });
        let log_file = log_file.map(|f| std::sync::Arc::new(Mutex::new(f)));

        let mut threads = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            threads.push(spawn_log_thread(label.clone(), stdout, log_file.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            threads.push(spawn_log_thread(label.clone(), stderr, log_file));
        }

        ProcessRunner {
            label,
            child: Mutex::new(Some(child)),
            pid: AtomicU32::new(pid),
            alive: AtomicBool::new(true),
            log_threads: Mutex::new(threads),
        }
    }

    /// The child's OS pid, or `None` if it never successfully spawned.
    pub fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            None
        } else {
            Some(pid)
        }
    }

    /// Has the wait handle not yet returned?
    pub fn liveness(&self) -> bool {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    self.alive.store(false, Ordering::SeqCst);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
        }
    }

    /// Block until the child exits. Interrupt-safe: `try_wait` is retried on
    /// `ErrorKind::Interrupted` rather than propagating it.
    pub fn wait(&self) -> Option<ExitStatus> {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let child = slot.as_mut()?;
        loop {
            match child.wait() {
                Ok(status) => return Some(status),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: failed to wait: {e}", self.label);
                    return None;
                }
            }
        }
    }

    /// Graceful-then-forceful termination. Best-effort and idempotent: calling
    /// it N times yields the same post-state as calling it once.
    pub fn kill(&self) {
        if !self.liveness() {
            return;
        }
        let Some(pid) = self.pid() else { return };

        #[cfg(unix)]
        {
            if supports_signals() {
                debug!("{}: sending terminate signal to pid {pid}", self.label);
                let _ = signal::send_sigterm(pid);
                if self.wait_out(GRACEFUL_TERM_GRACE) {
                    debug!("{}: pid {pid} exited after terminate signal", self.label);
                    return;
                }
                debug!("{}: escalating to forceful kill for pid {pid}", self.label);
                let _ = signal::send_sigkill(pid);
                if self.wait_out(FORCEFUL_TERM_GRACE) {
                    debug!("{}: pid {pid} exited after forceful kill", self.label);
                    return;
                }
                warn!("{}: pid {pid} still alive after forceful kill", self.label);
                return;
            }
        }

        // Platforms without signal-based termination: forceful kill only.
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = slot.as_mut() {
            if let Err(e) = child.kill() {
                warn!("{}: kill failed: {e}", self.label);
            }
        }
    }

    /// Poll liveness at one-second intervals for up to `timeout`, returning
    /// true once the child has exited.
    fn wait_out(&self, timeout: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if !self.liveness() {
                return true;
            }
            thread::sleep(TERM_POLL_INTERVAL);
        }
        !self.liveness()
    }

    /// Join the log-pumping threads. Best-effort; panics in the reader
    /// threads are swallowed rather than propagated.
    pub fn join_log_threads(&self) {
        let mut threads = self.log_threads.lock().unwrap_or_else(|e| e.into_inner());
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Spawn a thread that reads lines from `stream` and appends them to `log_file`.
fn spawn_log_thread<R>(
    label: String,
    stream: R,
    log_file: Option<std::sync::Arc<Mutex<std::fs::File>>>,
) -> JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{label}-reader"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while let Ok(n) = reader.read_line(&mut line) {
                if n == 0 {
                    break;
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if !trimmed.is_empty() {
                    if let Some(file) = &log_file {
                        let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
                        let _ = writeln!(f, "{trimmed}");
                    }
                }
                line.clear();
            }
        })
        .expect("failed to spawn child log thread")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_failure_leaves_never_alive_state() {
        let command = Command::new("/nonexistent/binary/path/for/sure");
        let runner = ProcessRunner::spawn("bogus", command, None);
        assert!(!runner.liveness());
        assert_eq!(runner.pid(), None);
        // kill()/wait() must be no-ops, not panics.
        runner.kill();
        assert!(runner.wait().is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_kill_is_idempotent() {
        let mut command = Command::new("sleep");
        command.arg("60");
        let runner = ProcessRunner::spawn("sleeper", command, None);
        assert!(runner.liveness());

        runner.kill();
        assert!(!runner.liveness());
        // Calling again must not panic or resurrect the process.
        runner.kill();
        assert!(!runner.liveness());
    }

    #[test]
    #[cfg(unix)]
    fn test_tees_stdout_to_log_file() {
        let dir = std::env::temp_dir().join(format!("sonic_daemon_proc_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let log_path = dir.join("child.log");

        let mut command = Command::new("sh");
        command.arg("-c").arg("echo hello-from-child");
        let runner = ProcessRunner::spawn("echoer", command, Some(log_path.clone()));
        runner.wait();
        runner.join_log_threads();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("hello-from-child"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn test_signal_process_exists() {
        let pid = std::process::id();
        assert!(signal::process_exists(pid));
        assert!(!signal::process_exists(999_999_999));
    }

    #[test]
    #[cfg(unix)]
    fn test_sigterm_on_dead_pid_is_success() {
        assert!(signal::send_sigterm(999_999_999).is_ok());
    }
}
