//! Configuration diff engine.
//!
//! Pure comparison of two validated program snapshots into a change set:
//! field name -> stringified new value. An empty set means "no change".
//! The engine never touches a live Program; the caller decides how to act
//! on the classification.

use std::collections::BTreeMap;

use crate::tm::config::ProgramConfig;

/// Field name -> stringified new value.
pub type ChangeSet = BTreeMap<&'static str, String>;

/// Fields whose change forces a stop+start of the whole program.
///
/// `instances` is deliberately absent: a pure instance-count change is
/// executed as an in-place scale so surviving children are not disturbed.
/// `umask` and `expected_exit_codes` are dynamic (snapshot-only; they
/// affect future children / future exit classifications).
const RESTART_REQUIRED: &[&str] = &[
    "command",
    "auto_start",
    "auto_restart",
    "working_directory",
    "start_time",
    "stop_time",
    "restart_attempts",
    "stop_signal",
    "environment_variables",
    "stdout_log",
    "stderr_log",
];

/// Compare `candidate` against `current`, returning every differing field.
pub fn diff(current: &ProgramConfig, candidate: &ProgramConfig) -> ChangeSet {
    let mut changes = ChangeSet::new();
    let mut record = |field: &'static str, differs: bool, value: String| {
        if differs {
            changes.insert(field, value);
        }
    };

    record(
        "command",
        current.command != candidate.command,
        candidate.command.join(" "),
    );
    record(
        "instances",
        current.instances != candidate.instances,
        candidate.instances.to_string(),
    );
    record(
        "auto_start",
        current.auto_start != candidate.auto_start,
        candidate.auto_start.to_string(),
    );
    record(
        "auto_restart",
        current.auto_restart != candidate.auto_restart,
        candidate.auto_restart.as_str().to_string(),
    );
    record(
        "start_time",
        current.start_time != candidate.start_time,
        candidate.start_time.to_string(),
    );
    record(
        "stop_time",
        current.stop_time != candidate.stop_time,
        candidate.stop_time.to_string(),
    );
    record(
        "restart_attempts",
        current.restart_attempts != candidate.restart_attempts,
        candidate.restart_attempts.to_string(),
    );
    record(
        "stop_signal",
        current.stop_signal != candidate.stop_signal,
        candidate.stop_signal.as_str().to_string(),
    );
    record(
        "expected_exit_codes",
        current.expected_exit_codes != candidate.expected_exit_codes,
        format!(
            "[{}]",
            candidate
                .expected_exit_codes
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    );
    record(
        "working_directory",
        current.working_directory != candidate.working_directory,
        candidate.working_directory.display().to_string(),
    );
    record(
        "umask",
        current.umask != candidate.umask,
        match candidate.umask {
            Some(m) => format!("{m:03o}"),
            None => "unset".to_string(),
        },
    );
    record(
        "stdout_log",
        current.stdout_log != candidate.stdout_log,
        candidate.stdout_log.display().to_string(),
    );
    record(
        "stderr_log",
        current.stderr_log != candidate.stderr_log,
        candidate.stderr_log.display().to_string(),
    );
    record(
        "environment_variables",
        current.environment != candidate.environment,
        candidate
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    );

    changes
}

/// True when any changed field forces a stop+start.
pub fn requires_restart(changes: &ChangeSet) -> bool {
    changes.keys().any(|k| RESTART_REQUIRED.contains(k))
}

/// True when the instance count changed and nothing forces a restart:
/// executed as an in-place scale that leaves surviving children alone.
pub fn is_scale_only(changes: &ChangeSet) -> bool {
    changes.contains_key("instances") && !requires_restart(changes)
}

/// One-line summary for log output, e.g. `command, instances`.
pub fn summarize(changes: &ChangeSet) -> String {
    changes.keys().copied().collect::<Vec<_>>().join(", ")
}
