//! ConfigLoader: parses the two optional user config files into normalized
//! option sets with defaults. Absence or parse error is never fatal — both
//! yield an empty option set and a logged warning.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;

// ============================================================================
// Audio Key Conversion
// ============================================================================

/// Fixed conversion table from human-readable audio-config keys to the
/// engine's single-letter command-line flags. Stable and enumerated here;
/// unknown keys are silently ignored rather than logged, so a newer config
/// format introducing a key doesn't spam an older daemon's log on boot.
const AUDIO_KEY_TABLE: &[(&str, &str)] = &[
    ("sound_card_sample_rate", "-S"),
    ("num_inputs", "-i"),
    ("num_outputs", "-o"),
    ("num_audio_bus_channels", "-a"),
    ("num_control_bus_channels", "-c"),
    ("hardware_buffer_size", "-Z"),
    ("block_size", "-z"),
    ("max_logins", "-l"),
    ("realtime_memory_locking", "-R"),
    ("publish_to_rendezvous", "-D"),
];

/// Keys treated as booleans: normalized to "1"/"0" rather than passed through verbatim.
const BOOLEAN_KEYS: &[&str] = &[
    "realtime_memory_locking",
    "publish_to_rendezvous",
];

fn flag_for_key(key: &str) -> Option<&'static str> {
    AUDIO_KEY_TABLE
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, flag)| *flag)
}

// ============================================================================
// Audio Config
// ============================================================================

/// Normalized audio-engine option set, ready to be merged into a scsynth
/// command line by the audio-engine supervisor.
#[derive(Debug, Clone, Default)]
pub struct AudioConfig {
    /// Parsed, key-converted flag -> value pairs from the user's config file.
    pub options: BTreeMap<String, String>,
    /// `enable_inputs`/`enable_outputs`, read separately since they drive
    /// post-merge zeroing rather than mapping to a flag of their own.
    pub enable_inputs: bool,
    pub enable_outputs: bool,
    /// Free-form string of extra flags, split by shell rules and appended
    /// after everything else.
    pub extra_flags: Vec<String>,
    /// When non-empty, fully replaces the merged option set.
    pub override_args: Vec<String>,
}

/// Load the audio config file. Missing file or parse error yields the
/// default (empty) option set and a logged warning; never fatal.
pub fn load_audio_config(path: &Path) -> AudioConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("audio config {path:?} not found or unreadable ({e}); using defaults");
            return AudioConfig::default();
        }
    };

    let table: toml::Value = match text.parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("audio config {path:?} failed to parse ({e}); using defaults");
            return AudioConfig::default();
        }
    };

    let Some(table) = table.as_table() else {
        warn!("audio config {path:?} is not a key/value document; using defaults");
        return AudioConfig::default();
    };

    let mut cfg = AudioConfig {
        enable_inputs: true,
        enable_outputs: true,
        ..Default::default()
    };

    for (key, value) in table {
        match key.as_str() {
            "enable_inputs" => cfg.enable_inputs = value.as_bool().unwrap_or(true),
            "enable_outputs" => cfg.enable_outputs = value.as_bool().unwrap_or(true),
            "extra_flags" => {
                if let Some(s) = value.as_str() {
                    cfg.extra_flags = split_shell_words(s);
                }
            }
            "override" => {
                if let Some(s) = value.as_str() {
                    if !s.trim().is_empty() {
                        cfg.override_args = split_shell_words(s);
                    }
                }
            }
            other => {
                let Some(flag) = flag_for_key(other) else {
                    continue; // unknown keys are silently ignored
                };
                let normalized = if BOOLEAN_KEYS.contains(&other) {
                    if value.as_bool().unwrap_or(false) {
                        "1".to_string()
                    } else {
                        "0".to_string()
                    }
                } else if let Some(s) = value.as_str() {
                    s.trim().to_string()
                } else {
                    value.to_string().trim_matches('"').to_string()
                };
                cfg.options.insert(flag.to_string(), normalized);
            }
        }
    }

    cfg
}

/// Split a free-form string by simple shell rules: whitespace-separated
/// tokens, with single- or double-quoted runs kept intact.
fn split_shell_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_word = true;
                } else if c.is_whitespace() {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                } else {
                    current.push(c);
                    in_word = true;
                }
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Default scsynth options applied before the user's parsed options.
fn builtin_defaults() -> BTreeMap<String, String> {
    let mut defaults = BTreeMap::new();
    defaults.insert("-S".to_string(), "44100".to_string());
    defaults.insert("-i".to_string(), "2".to_string());
    defaults.insert("-o".to_string(), "2".to_string());
    defaults.insert("-a".to_string(), "1024".to_string());
    defaults.insert("-z".to_string(), "64".to_string());
    defaults
}

/// OS-specific defaults, applied after the built-in defaults but before the
/// user's parsed options.
fn os_specific_defaults() -> BTreeMap<String, String> {
    let mut defaults = BTreeMap::new();
    if cfg!(target_os = "linux") {
        defaults.insert("-R".to_string(), "0".to_string());
    }
    defaults
}

/// Merge the scsynth option set, earliest-loses:
/// `{ -u: scsynth_port }` <- defaults <- OS-specific defaults <- parsed user
/// options <- extra flags. An explicit non-empty override replaces the whole
/// merged set. Post-merge, disabled inputs/outputs are forced to zero.
pub fn build_scsynth_args(scsynth_port: u16, cfg: &AudioConfig) -> Vec<String> {
    if !cfg.override_args.is_empty() {
        return cfg.override_args.clone();
    }

    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    merged.insert("-u".to_string(), scsynth_port.to_string());
    merged.extend(builtin_defaults());
    merged.extend(os_specific_defaults());
    merged.extend(cfg.options.clone());

    if !cfg.enable_inputs {
        merged.insert("-i".to_string(), "0".to_string());
    }
    if !cfg.enable_outputs {
        merged.insert("-o".to_string(), "0".to_string());
    }

    let mut args: Vec<String> = Vec::with_capacity(merged.len() * 2 + cfg.extra_flags.len());
    for (flag, value) in merged {
        args.push(flag);
        args.push(value);
    }
    args.extend(cfg.extra_flags.iter().cloned());
    args
}

// ============================================================================
// Runtime Config
// ============================================================================

/// Normalized runtime (BEAM child) option set.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Accepts only "dev" or "prod"; anything else (including absence) falls
    /// back to `default`.
    pub environment: String,
    /// Accepted only if a positive integer; otherwise falls back to `default`.
    pub http_port: u16,
}

const DEFAULT_RUNTIME_ENVIRONMENT: &str = "prod";
const DEFAULT_RUNTIME_HTTP_PORT: u16 = 4000;

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            environment: DEFAULT_RUNTIME_ENVIRONMENT.to_string(),
            http_port: DEFAULT_RUNTIME_HTTP_PORT,
        }
    }
}

/// Load the runtime config file. Missing file or parse error yields the
/// default option set and a logged warning; never fatal.
pub fn load_runtime_config(path: &Path) -> RuntimeConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("runtime config {path:?} not found or unreadable ({e}); using defaults");
            return RuntimeConfig::default();
        }
    };

    let table: toml::Value = match text.parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("runtime config {path:?} failed to parse ({e}); using defaults");
            return RuntimeConfig::default();
        }
    };

    let mut cfg = RuntimeConfig::default();

    if let Some(env) = table.get("environment").and_then(|v| v.as_str()) {
        if env == "dev" || env == "prod" {
            cfg.environment = env.to_string();
        } else {
            warn!("runtime config environment {env:?} is not dev/prod; using default");
        }
    }

    if let Some(port) = table.get("http_port") {
        let as_i64 = port.as_integer();
        match as_i64 {
            Some(p) if p > 0 && p <= u16::MAX as i64 => cfg.http_port = p as u16,
            _ => warn!("runtime config http_port must be a positive integer; using default"),
        }
    }

    cfg
}

/// Apply the `SONIC_DAEMON_ENV` environment variable override, if present and
/// valid. The environment variable, when set to a valid value, takes
/// precedence over the config file's `environment` key (Open Question
/// resolved in DESIGN.md).
pub fn apply_environment_override(cfg: &mut RuntimeConfig) {
    if let Ok(env) = std::env::var("SONIC_DAEMON_ENV") {
        if env == "dev" || env == "prod" {
            cfg.environment = env;
        } else {
            warn!("SONIC_DAEMON_ENV={env:?} is not dev/prod; ignoring");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sonic_daemon_config_test_{}_{}.toml",
            std::process::id(),
            rand::random::<u64>()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_absent_audio_config_yields_defaults() {
        let cfg = load_audio_config(Path::new("/nonexistent/audio.toml"));
        assert!(cfg.options.is_empty());
        assert!(cfg.enable_inputs);
        assert!(cfg.enable_outputs);
    }

    #[test]
    fn test_unknown_key_is_silently_skipped() {
        let path = write_temp("totally_unknown_key = \"whatever\"\n");
        let cfg = load_audio_config(&path);
        assert!(cfg.options.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_known_key_maps_to_flag() {
        let path = write_temp("sound_card_sample_rate = \"48000\"\n");
        let cfg = load_audio_config(&path);
        assert_eq!(cfg.options.get("-S").map(String::as_str), Some("48000"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_enable_inputs_false_zeroes_input_count() {
        let path = write_temp("enable_inputs = false\n");
        let cfg = load_audio_config(&path);
        let args = build_scsynth_args(57110, &cfg);
        let i_index = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i_index + 1], "0");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_override_replaces_entire_merged_set() {
        let path = write_temp("sound_card_sample_rate = \"48000\"\noverride = \"-u 1234 -a 999\"\n");
        let cfg = load_audio_config(&path);
        let args = build_scsynth_args(57110, &cfg);
        assert_eq!(args, vec!["-u", "1234", "-a", "999"]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_merge_order_user_options_beat_defaults() {
        let path = write_temp("sound_card_sample_rate = \"22050\"\n");
        let cfg = load_audio_config(&path);
        let args = build_scsynth_args(57110, &cfg);
        let s_index = args.iter().position(|a| a == "-S").unwrap();
        assert_eq!(args[s_index + 1], "22050");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_absent_runtime_config_yields_defaults() {
        let cfg = load_runtime_config(Path::new("/nonexistent/runtime.toml"));
        assert_eq!(cfg.environment, "prod");
        assert_eq!(cfg.http_port, 4000);
    }

    #[test]
    fn test_runtime_config_rejects_bad_environment() {
        let path = write_temp("environment = \"staging\"\n");
        let cfg = load_runtime_config(&path);
        assert_eq!(cfg.environment, "prod");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_runtime_config_accepts_dev() {
        let path = write_temp("environment = \"dev\"\nhttp_port = 4001\n");
        let cfg = load_runtime_config(&path);
        assert_eq!(cfg.environment, "dev");
        assert_eq!(cfg.http_port, 4001);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_runtime_config_rejects_negative_port() {
        let path = write_temp("http_port = -1\n");
        let cfg = load_runtime_config(&path);
        assert_eq!(cfg.http_port, 4000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_split_shell_words_keeps_quoted_runs_intact() {
        let words = split_shell_words(r#"-a b "c d" 'e f'"#);
        assert_eq!(words, vec!["-a", "b", "c d", "e f"]);
    }
}
