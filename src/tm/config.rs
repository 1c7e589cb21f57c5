//! Configuration document reader.
//!
//! The supervisor is configured by a single YAML file: top-level logging
//! settings plus a `programs` mapping. File-schema structs are strict
//! (`deny_unknown_fields`); value validation happens in a second pass so
//! every rejection names the program and the offending field.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::tm::error::{Result, SupervisorError};

/// Validated top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub logging_enabled: bool,
    pub log_file: PathBuf,
    pub programs: BTreeMap<String, ProgramConfig>,
}

/// Validated immutable snapshot of one program's configuration.
///
/// Replaced wholesale on reload; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramConfig {
    pub name: String,
    /// Command tokens; the first token is the executable (PATH-searched).
    pub command: Vec<String>,
    /// Target count of concurrent children.
    pub instances: u32,
    pub auto_start: bool,
    pub auto_restart: AutoRestart,
    /// Seconds a child must stay alive to count as successfully started.
    pub start_time: u64,
    /// Graceful-termination budget: signal-send iterations before SIGKILL.
    pub stop_time: u64,
    /// Extra launch attempts per start request (total = this + 1).
    pub restart_attempts: u32,
    pub stop_signal: StopSignal,
    pub expected_exit_codes: BTreeSet<i32>,
    pub working_directory: PathBuf,
    /// File-creation mask applied in the child; `None` means leave inherited.
    pub umask: Option<u32>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Applied on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRestart {
    Always,
    Never,
    Unexpected,
}

impl AutoRestart {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoRestart::Always => "always",
            AutoRestart::Never => "never",
            AutoRestart::Unexpected => "unexpected",
        }
    }

    fn parse(s: &str) -> Option<AutoRestart> {
        match s.trim() {
            "always" => Some(AutoRestart::Always),
            "never" => Some(AutoRestart::Never),
            "unexpected" => Some(AutoRestart::Unexpected),
            _ => None,
        }
    }
}

/// The recognized graceful-stop signal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Int,
    Kill,
    Stop,
    Cont,
}

impl StopSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Int => "SIGINT",
            StopSignal::Kill => "SIGKILL",
            StopSignal::Stop => "SIGSTOP",
            StopSignal::Cont => "SIGCONT",
        }
    }

    pub fn signal(&self) -> Signal {
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
            StopSignal::Stop => Signal::SIGSTOP,
            StopSignal::Cont => Signal::SIGCONT,
        }
    }

    fn parse(s: &str) -> Option<StopSignal> {
        let raw = s.trim().to_uppercase();
        let name = raw.strip_prefix("SIG").unwrap_or(&raw);
        match name {
            "TERM" => Some(StopSignal::Term),
            "INT" => Some(StopSignal::Int),
            "KILL" => Some(StopSignal::Kill),
            "STOP" => Some(StopSignal::Stop),
            "CONT" => Some(StopSignal::Cont),
            _ => None,
        }
    }
}

// -------- YAML file schema (strict; validated into the types above) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    logging_enabled: bool,
    #[serde(default = "default_log_file")]
    log_file: PathBuf,
    #[serde(default)]
    programs: BTreeMap<String, ProgramFile>,
}

fn default_log_file() -> PathBuf {
    "taskmaster.log".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramFile {
    command: String,
    instances: i64,
    auto_start: bool,
    auto_restart: String,
    start_time: i64,
    stop_time: i64,
    restart_attempts: i64,
    stop_signal: String,
    #[serde(default = "default_expected_exit_codes")]
    expected_exit_codes: Vec<i32>,
    working_directory: PathBuf,
    #[serde(default, deserialize_with = "deserialize_umask")]
    umask: Option<u32>,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
    #[serde(default)]
    environment_variables: Vec<String>,
}

fn default_expected_exit_codes() -> Vec<i32> {
    vec![0]
}

fn deserialize_umask<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .and_then(|x| u32::try_from(x).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom("umask must be a non-negative integer")),
        serde_yaml::Value::String(s) => parse_umask_str(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "umask must be an integer, an octal string (e.g. \"022\"), or null",
        )),
    }
}

fn parse_umask_str(s: &str) -> std::result::Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid umask {s:?}: {e}"))
}

/// Read, parse, and validate the whole configuration tree.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SupervisorError::invalid_config(path.display().to_string(), format!("read failed: {e}"))
    })?;
    let file: ConfigFile = serde_yaml::from_str(&raw).map_err(|e| {
        SupervisorError::invalid_config(path.display().to_string(), format!("parse failed: {e}"))
    })?;

    let mut programs = BTreeMap::new();
    for (name, entry) in &file.programs {
        let cfg = validate_program(name, entry)?;
        programs.insert(name.clone(), cfg);
    }

    Ok(Config {
        logging_enabled: file.logging_enabled,
        log_file: file.log_file,
        programs,
    })
}

fn validate_program(name: &str, entry: &ProgramFile) -> Result<ProgramConfig> {
    let fail = |message: String| SupervisorError::invalid_config(name, message);

    if name.trim().is_empty() {
        return Err(SupervisorError::invalid_config(
            "programs",
            "program name must not be empty",
        ));
    }

    let command: Vec<String> = entry
        .command
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if command.is_empty() {
        return Err(fail("command: must not be empty".to_string()));
    }

    let non_negative = |field: &str, v: i64| -> Result<u64> {
        u64::try_from(v).map_err(|_| fail(format!("{field}: must be >= 0, got {v}")))
    };
    let instances = non_negative("instances", entry.instances)? as u32;
    let start_time = non_negative("start_time", entry.start_time)?;
    let stop_time = non_negative("stop_time", entry.stop_time)?;
    let restart_attempts = non_negative("restart_attempts", entry.restart_attempts)? as u32;

    let auto_restart = AutoRestart::parse(&entry.auto_restart).ok_or_else(|| {
        fail(format!(
            "auto_restart: expected always|never|unexpected, got {:?}",
            entry.auto_restart
        ))
    })?;

    let stop_signal = StopSignal::parse(&entry.stop_signal)
        .ok_or_else(|| fail(format!("stop_signal: unrecognized signal {:?}", entry.stop_signal)))?;

    if let Some(mask) = entry.umask {
        if mask > 0o777 {
            return Err(fail(format!("umask: {mask:#o} out of range (max 0o777)")));
        }
    }

    if entry.working_directory.as_os_str().is_empty() {
        return Err(fail("working_directory: must not be empty".to_string()));
    }
    if entry.stdout_log.as_os_str().is_empty() {
        return Err(fail("stdout_log: must not be empty".to_string()));
    }
    if entry.stderr_log.as_os_str().is_empty() {
        return Err(fail("stderr_log: must not be empty".to_string()));
    }

    let mut environment = BTreeMap::new();
    for var in &entry.environment_variables {
        let Some((key, value)) = var.split_once('=') else {
            return Err(fail(format!(
                "environment_variables: entry {var:?} is missing '='"
            )));
        };
        if key.is_empty() {
            return Err(fail(format!(
                "environment_variables: entry {var:?} has an empty key"
            )));
        }
        if environment
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            return Err(fail(format!(
                "environment_variables: duplicate key {key:?}"
            )));
        }
    }

    Ok(ProgramConfig {
        name: name.to_string(),
        command,
        instances,
        auto_start: entry.auto_start,
        auto_restart,
        start_time,
        stop_time,
        restart_attempts,
        stop_signal,
        expected_exit_codes: entry.expected_exit_codes.iter().copied().collect(),
        working_directory: entry.working_directory.clone(),
        umask: entry.umask,
        stdout_log: entry.stdout_log.clone(),
        stderr_log: entry.stderr_log.clone(),
        environment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        (dir, path)
    }

    const BASIC: &str = r#"
logging_enabled: true
log_file: /tmp/taskmaster-test.log
programs:
  web:
    command: "/bin/sleep 60"
    instances: 3
    auto_start: true
    auto_restart: unexpected
    start_time: 1
    stop_time: 5
    restart_attempts: 2
    stop_signal: SIGTERM
    expected_exit_codes: [0, 2]
    working_directory: /tmp
    umask: 18
    stdout_log: /tmp/web.out
    stderr_log: /tmp/web.err
    environment_variables:
      - "PORT=8080"
      - "EMPTY="
"#;

    #[test]
    fn parses_full_document() {
        let (_dir, path) = write_config(BASIC);
        let cfg = load_config(&path).unwrap();
        assert!(cfg.logging_enabled);
        let web = &cfg.programs["web"];
        assert_eq!(web.command, vec!["/bin/sleep", "60"]);
        assert_eq!(web.instances, 3);
        assert_eq!(web.auto_restart, AutoRestart::Unexpected);
        assert_eq!(web.stop_signal, StopSignal::Term);
        assert!(web.expected_exit_codes.contains(&2));
        assert_eq!(web.umask, Some(18));
        assert_eq!(web.environment["PORT"], "8080");
        assert_eq!(web.environment["EMPTY"], "");
    }

    #[test]
    fn umask_accepts_octal_string_and_null() {
        let yaml = BASIC.replace("umask: 18", "umask: \"022\"");
        let (_dir, path) = write_config(&yaml);
        let cfg = load_config(&path).unwrap();
        // "022" parsed as octal equals decimal 18.
        assert_eq!(cfg.programs["web"].umask, Some(0o22));

        let yaml = BASIC.replace("umask: 18", "umask: null");
        let (_dir, path) = write_config(&yaml);
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.programs["web"].umask, None);
    }

    #[test]
    fn rejects_negative_instances() {
        let yaml = BASIC.replace("instances: 3", "instances: -1");
        let (_dir, path) = write_config(&yaml);
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("web"));
        assert!(err.contains("instances"));
    }

    #[test]
    fn rejects_unknown_auto_restart() {
        let yaml = BASIC.replace("auto_restart: unexpected", "auto_restart: sometimes");
        let (_dir, path) = write_config(&yaml);
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("auto_restart"));
    }

    #[test]
    fn rejects_signal_outside_recognized_set() {
        let yaml = BASIC.replace("stop_signal: SIGTERM", "stop_signal: SIGUSR1");
        let (_dir, path) = write_config(&yaml);
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("stop_signal"));
    }

    #[test]
    fn rejects_env_entry_without_equals() {
        let yaml = BASIC.replace("- \"PORT=8080\"", "- \"PORT\"");
        let (_dir, path) = write_config(&yaml);
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("environment_variables"));
    }

    #[test]
    fn rejects_duplicate_env_keys() {
        let yaml = BASIC.replace("- \"EMPTY=\"", "- \"PORT=9090\"");
        let (_dir, path) = write_config(&yaml);
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("duplicate key"));
    }

    #[test]
    fn rejects_unknown_program_field() {
        let yaml = BASIC.replace("stderr_log: /tmp/web.err", "stderr_log: /tmp/web.err\n    nice_level: 5");
        let (_dir, path) = write_config(&yaml);
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn optional_fields_have_defaults() {
        let yaml = r#"
programs:
  job:
    command: "/bin/true"
    instances: 1
    auto_start: false
    auto_restart: never
    start_time: 0
    stop_time: 1
    restart_attempts: 0
    stop_signal: TERM
    working_directory: /
    stdout_log: /tmp/job.out
    stderr_log: /tmp/job.err
"#;
        let (_dir, path) = write_config(yaml);
        let cfg = load_config(&path).unwrap();
        let job = &cfg.programs["job"];
        assert_eq!(job.expected_exit_codes.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(job.environment.is_empty());
        assert_eq!(job.umask, None);
        assert!(!cfg.logging_enabled);
    }

    #[test]
    fn missing_file_is_invalid_config() {
        let err = load_config(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert_eq!(err.as_label(), "invalid_config");
    }
}
