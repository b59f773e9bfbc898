//! Logger component: an append-only timestamped log file with log rotation.
//!
//! Provides timestamp generation, log directory resolution, the daemon's own
//! append-only log sink, and the startup log-rotation procedure described in
//! the Orchestrator's boot sequence.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::warn;

use crate::constants::{CANONICAL_LOG_FILES, MAX_LOG_HISTORY};

// ============================================================================
// Timestamp Generation
// ============================================================================

/// Generate a timestamp string in format "YYYY-MM-DD HH:MM:SS.mmm".
/// Uses libc for local time conversion to avoid a chrono dependency.
pub fn timestamp() -> String {
    use libc::{localtime_r, strftime, time_t, tm};
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let secs = now.as_secs() as time_t;
    let millis = now.subsec_millis();

    // SAFETY: localtime_r is thread-safe (uses a caller-provided tm struct).
    let mut tm: tm = unsafe { std::mem::zeroed() };
    unsafe {
        localtime_r(&secs, &mut tm);
    }

    let mut buf = [0u8; 32];
    let fmt = b"%Y-%m-%d %H:%M:%S\0";
    // SAFETY: strftime writes into our buffer; the format string is null-terminated.
    let len = unsafe {
        strftime(
            buf.as_mut_ptr() as *mut i8,
            buf.len(),
            fmt.as_ptr() as *const i8,
            &tm,
        )
    };
    let prefix = std::str::from_utf8(&buf[..len as usize]).unwrap_or("1970-01-01 00:00:00");
    format!("{prefix}.{millis:03}")
}

/// Sanitize a timestamp for use as a filesystem path component.
fn sanitize_timestamp(ts: &str) -> String {
    ts.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

// ============================================================================
// Directory Resolution
// ============================================================================

/// Resolve the daemon's log directory.
/// Prefers `SONIC_DAEMON_LOG_DIR`, then falls back to the platform temp dir.
pub fn log_dir() -> PathBuf {
    std::env::var_os("SONIC_DAEMON_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Resolve the directory user config files are read from.
/// Prefers `SONIC_DAEMON_CONFIG_DIR`, then falls back to the platform temp dir
/// (matching the daemon's log directory when unset, since both are normally
/// colocated under the front-end's working directory).
pub fn config_dir() -> PathBuf {
    std::env::var_os("SONIC_DAEMON_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

// ============================================================================
// Logger
// ============================================================================

/// Append-only timestamped log file with an error-formatting helper.
///
/// Writes are synchronized with an internal mutex so interleaving from any
/// task always produces whole, line-oriented records. Open/write failures are
/// non-fatal: the logger silently degrades to a no-op sink after reporting
/// once to stderr.
pub struct Logger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Logger {
    /// Open (or create) the log file at `path` in append mode, preserving any
    /// previous contents: the boot sequence opens the log before it attempts
    /// rotation, so truncation happens there, not here. Failure to open is
    /// reported to stderr once; the Logger still returns a usable (degraded)
    /// instance rather than an error — transient I/O around logs is never
    /// fatal.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                eprintln!("[sonic_daemon] warning: failed to open log {path:?}: {e}");
            })
            .ok();
        Logger {
            path,
            file: Mutex::new(file),
        }
    }

    /// Append a single line to the log, stamped with the current time.
    pub fn log(&self, line: &str) {
        let stamped = format!("[{}] {line}\n", timestamp());
        let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = slot.as_mut() {
            if let Err(e) = file.write_all(stamped.as_bytes()) {
                eprintln!(
                    "[sonic_daemon] warning: failed to write log {:?}: {e}",
                    self.path
                );
                *slot = None;
            }
        }
    }

    /// Append an error line built from a short context string and a displayable error.
    pub fn error(&self, context: &str, err: &dyn std::fmt::Display) {
        self.log(&format!("ERROR: {context}: {err}"));
    }

    /// Close the underlying file handle. Idempotent.
    pub fn close(&self) {
        let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

// ============================================================================
// Log Rotation
// ============================================================================

/// Rotate the daemon's canonical log files into a timestamped history
/// directory, then truncate them for the new boot, then prune old history
/// snapshots so at most `MAX_LOG_HISTORY` remain.
///
/// All failures here are non-fatal and are only logged through the `log`
/// crate's diagnostic channel, since the Logger's own file is one of the
/// things being rotated.
pub fn rotate_logs(dir: &Path) {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("failed to create log dir {dir:?}: {e}");
        return;
    }

    let history_root = dir.join("history");
    if let Err(e) = fs::create_dir_all(&history_root) {
        warn!("failed to create history dir {history_root:?}: {e}");
        return;
    }

    let snapshot_name = sanitize_timestamp(&timestamp());
    let history_dir = history_root.join(snapshot_name);

    let existing_logs: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();

    if !existing_logs.is_empty() {
        if let Err(e) = fs::create_dir_all(&history_dir) {
            warn!("failed to create history dir {history_dir:?}: {e}");
        } else {
            for log_path in &existing_logs {
                if let Some(name) = log_path.file_name() {
                    if let Err(e) = fs::copy(log_path, history_dir.join(name)) {
                        warn!("failed to archive {log_path:?}: {e}");
                    }
                }
            }
        }
    }

    for name in CANONICAL_LOG_FILES {
        let path = dir.join(name);
        if let Err(e) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
        {
            warn!("failed to truncate {path:?}: {e}");
        }
    }

    prune_history(&dir.join("history"));
}

/// Keep at most `MAX_LOG_HISTORY` history snapshots, dropping the oldest first.
fn prune_history(history_root: &Path) {
    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = match fs::read_dir(history_root) {
        Ok(it) => it
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if !path.is_dir() {
                    return None;
                }
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((path, modified))
            })
            .collect(),
        Err(_) => return,
    };

    if entries.len() <= MAX_LOG_HISTORY {
        return;
    }

    entries.sort_by_key(|(_, modified)| *modified);
    let overflow = entries.len() - MAX_LOG_HISTORY;
    for (path, _) in entries.into_iter().take(overflow) {
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!("failed to prune history snapshot {path:?}: {e}");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert!(ts.len() >= 23, "timestamp too short: {ts}");
        assert!(ts.contains('-'));
        assert!(ts.contains(':'));
        assert!(ts.contains('.'));
    }

    #[test]
    fn test_sanitize_timestamp_has_no_path_separators() {
        let sanitized = sanitize_timestamp("2026-07-28 10:30:00.123");
        assert!(!sanitized.contains('/'));
        assert!(!sanitized.contains(':'));
        assert!(!sanitized.contains(' '));
    }

    #[test]
    fn test_logger_writes_and_closes() {
        let dir = std::env::temp_dir().join(format!("sonic_daemon_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("daemon.log");
        let logger = Logger::open(&path);
        logger.log("hello");
        logger.error("boot", &"disk full");
        logger.close();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("ERROR: boot: disk full"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotate_logs_on_empty_directory_creates_history_and_no_stray_log() {
        let dir = std::env::temp_dir().join(format!("sonic_daemon_rotate_empty_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        rotate_logs(&dir);

        assert!(dir.join("history").is_dir());
        // No prior logs existed, so no snapshot subdirectory should have been made.
        let snapshots: Vec<_> = fs::read_dir(dir.join("history")).unwrap().collect();
        assert!(snapshots.is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotate_logs_prunes_to_ten_snapshots() {
        let dir = std::env::temp_dir().join(format!("sonic_daemon_rotate_prune_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("history")).unwrap();

        for i in 0..11 {
            let snap = dir.join("history").join(format!("snap-{i:02}"));
            fs::create_dir_all(&snap).unwrap();
            // Force distinct mtimes so pruning order is deterministic.
            std::thread::sleep(Duration::from_millis(5));
            File::create(snap.join("daemon.log")).unwrap();
        }

        prune_history(&dir.join("history"));

        let remaining: Vec<_> = fs::read_dir(dir.join("history")).unwrap().collect();
        assert_eq!(remaining.len(), MAX_LOG_HISTORY);

        let _ = fs::remove_dir_all(&dir);
    }
}
