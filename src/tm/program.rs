//! Per-program lifecycle engine.
//!
//! A `Program` owns its children and one monitor worker thread. Lifecycle
//! operations (`start`, `stop`, `reload`, scale) are serialized by an ops
//! mutex and are synchronous: when they return, the transition is complete
//! or has failed. Child pids and the config snapshot live behind a separate
//! state mutex that is never held across a sleep.
//!
//! The monitor reaps exits with `waitpid(WNOHANG)` at a 100 ms cadence and
//! drives the restart policy. Monitor-initiated restarts take the ops mutex
//! with `try_lock`: a contended lock means a controller-driven transition is
//! in flight and owns the outcome, which is what keeps `stop`'s
//! halt-then-join free of deadlock.

use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{self, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::tm::config::{AutoRestart, ProgramConfig};
use crate::tm::diff;
use crate::tm::error::{Result, SupervisorError};
use crate::tm::logger::Logger;

const MONITOR_POLL: Duration = Duration::from_millis(100);
const REAP_TICK: Duration = Duration::from_millis(100);
/// Reap ticks after each graceful signal send before the next send.
const REAP_TICKS_PER_SEND: u32 = 10;

/// Aggregate lifecycle phase, derived for status and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Degraded => "DEGRADED",
            Phase::Stopping => "STOPPING",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a reaped child exit.
#[derive(Debug, Clone, Copy)]
enum ExitOutcome {
    Exited(i32),
    Signaled(Signal),
    Unknown,
}

impl ExitOutcome {
    fn is_expected(&self, cfg: &ProgramConfig) -> bool {
        match self {
            ExitOutcome::Exited(code) => cfg.expected_exit_codes.contains(code),
            ExitOutcome::Signaled(_) | ExitOutcome::Unknown => false,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "outcome=exited exit_code={code}"),
            ExitOutcome::Signaled(sig) => write!(f, "outcome=signaled signal={sig}"),
            ExitOutcome::Unknown => write!(f, "outcome=unknown"),
        }
    }
}

struct State {
    config: ProgramConfig,
    child_pids: Vec<Pid>,
    monitor: Option<JoinHandle<()>>,
}

struct Shared {
    name: String,
    logger: Arc<Logger>,
    /// Serializes lifecycle transitions; never held by the monitor poll loop.
    ops: Mutex<()>,
    state: Mutex<State>,
    stop_requested: AtomicBool,
    suppress_auto_restart: AtomicBool,
    monitor_active: AtomicBool,
    failed: AtomicBool,
}

pub struct Program {
    shared: Arc<Shared>,
}

impl Program {
    pub fn new(config: ProgramConfig, logger: Arc<Logger>) -> Program {
        let name = config.name.clone();
        Program {
            shared: Arc::new(Shared {
                name,
                logger,
                ops: Mutex::new(()),
                state: Mutex::new(State {
                    config,
                    child_pids: Vec::new(),
                    monitor: None,
                }),
                stop_requested: AtomicBool::new(false),
                // Held whenever the program is not running; released by a
                // successful start.
                suppress_auto_restart: AtomicBool::new(true),
                monitor_active: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current configuration snapshot (cloned).
    pub fn config(&self) -> ProgramConfig {
        self.shared.config_snapshot()
    }

    pub fn auto_start(&self) -> bool {
        self.shared.config_snapshot().auto_start
    }

    pub fn target_instance_count(&self) -> u32 {
        self.shared.config_snapshot().instances
    }

    pub fn running_instance_count(&self) -> usize {
        self.shared.lock_state().child_pids.len()
    }

    /// Currently tracked child pids, oldest first.
    pub fn child_pids(&self) -> Vec<i32> {
        self.shared
            .lock_state()
            .child_pids
            .iter()
            .map(|p| p.as_raw())
            .collect()
    }

    pub fn is_fully_running(&self) -> bool {
        let st = self.shared.lock_state();
        st.config.instances > 0 && st.child_pids.len() == st.config.instances as usize
    }

    /// One human-readable line, e.g. `3 out of 3 instances running`.
    pub fn status_line(&self) -> String {
        let st = self.shared.lock_state();
        format!(
            "{} out of {} instances running",
            st.child_pids.len(),
            st.config.instances
        )
    }

    pub fn phase(&self) -> Phase {
        let shared = &self.shared;
        let (children, target) = {
            let st = shared.lock_state();
            (st.child_pids.len(), st.config.instances as usize)
        };
        if shared.failed.load(Ordering::Relaxed) {
            Phase::Failed
        } else if shared.stop_requested.load(Ordering::Relaxed) && children > 0 {
            Phase::Stopping
        } else if children == 0 {
            Phase::Idle
        } else if shared.suppress_auto_restart.load(Ordering::Relaxed) {
            Phase::Starting
        } else if children < target {
            Phase::Degraded
        } else {
            Phase::Running
        }
    }

    /// Launch children until fully running, within the attempt budget.
    pub fn start(&self) -> Result<()> {
        let _ops = self.shared.lock_ops();
        start_locked(&self.shared)
    }

    /// Stop every child (graceful, then forced) and halt the monitor.
    /// Idempotent.
    pub fn stop(&self) -> Result<()> {
        let _ops = self.shared.lock_ops();
        self.shared.stop_locked()
    }

    /// Stop the most-recently-added instance only.
    pub fn stop_one_instance(&self) -> Result<()> {
        let _ops = self.shared.lock_ops();
        self.shared.stop_one_locked()
    }

    /// Apply a validated candidate configuration: diff, swap the snapshot,
    /// then restart, scale, or apply dynamically as classified.
    pub fn reload(&self, candidate: ProgramConfig) -> Result<()> {
        let shared = &self.shared;
        let _ops = shared.lock_ops();

        let current = shared.config_snapshot();
        let changes = diff::diff(&current, &candidate);
        if changes.is_empty() {
            shared
                .logger
                .info("reload", Some(&shared.name), "no changes");
            return Ok(());
        }
        shared.logger.info(
            "reload",
            Some(&shared.name),
            format!("changed: {}", diff::summarize(&changes)),
        );

        let restart = diff::requires_restart(&changes);
        let scale = diff::is_scale_only(&changes);
        let umask_changed = changes.contains_key("umask");

        shared.lock_state().config = candidate.clone();

        if restart {
            shared.stop_locked()?;
            if candidate.auto_start {
                start_locked(shared)?;
            }
            return Ok(());
        }

        if umask_changed {
            if let Some(mask) = candidate.umask {
                // Future children only; current ones keep their mask.
                stat::umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
                shared.logger.info(
                    "reload",
                    Some(&shared.name),
                    format!("umask={mask:03o} applied"),
                );
            }
        }
        if scale {
            scale_locked(shared)?;
        }
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        // Backstop: no child and no worker outlives the Program. Normal
        // paths have already stopped; this is then a no-op.
        let _ = self.stop();
        let handle = self.shared.lock_state().monitor.take();
        if let Some(h) = handle {
            self.shared.stop_requested.store(true, Ordering::Relaxed);
            let _ = h.join();
            self.shared.stop_requested.store(false, Ordering::Relaxed);
        }
    }
}

impl Shared {
    fn lock_ops(&self) -> std::sync::MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn config_snapshot(&self) -> ProgramConfig {
        self.lock_state().config.clone()
    }

    fn running_count(&self) -> usize {
        self.lock_state().child_pids.len()
    }

    fn fully_running(&self, cfg: &ProgramConfig) -> bool {
        self.running_count() == cfg.instances as usize
    }

    fn forget(&self, pid: Pid) {
        self.lock_state().child_pids.retain(|p| *p != pid);
    }

    /// Fork/exec one child: cwd, umask (when set), append-mode log
    /// redirection, environment overlay, PATH-searching exec.
    fn spawn_instance(&self, cfg: &ProgramConfig) -> Result<Pid> {
        let spawn_err = |e: std::io::Error| SupervisorError::SpawnFailed {
            program: cfg.name.clone(),
            source: e,
        };
        let open_log = |path: &Path| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o644)
                .open(path)
        };
        let stdout = open_log(&cfg.stdout_log).map_err(spawn_err)?;
        let stderr = open_log(&cfg.stderr_log).map_err(spawn_err)?;

        let mut cmd = Command::new(&cfg.command[0]);
        cmd.args(&cfg.command[1..])
            .current_dir(&cfg.working_directory)
            .envs(cfg.environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(mask) = cfg.umask {
            unsafe {
                cmd.pre_exec(move || {
                    stat::umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    /// Caller holds the ops mutex.
    fn stop_locked(&self) -> Result<()> {
        let cfg = self.config_snapshot();
        self.failed.store(false, Ordering::Relaxed);
        {
            let st = self.lock_state();
            if st.child_pids.is_empty() && st.monitor.is_none() {
                return Ok(());
            }
        }

        self.suppress_auto_restart.store(true, Ordering::Relaxed);
        self.stop_requested.store(true, Ordering::Relaxed);
        let handle = self.lock_state().monitor.take();
        if let Some(h) = handle {
            if h.thread().id() == thread::current().id() {
                // Exhaustion path running on the monitor itself; joining
                // here would deadlock. The worker idles on and is joined by
                // the next stop or by drop.
                self.lock_state().monitor = Some(h);
            } else {
                let _ = h.join();
            }
        }

        // Children may already be half-reaped by the monitor; loop until the
        // tracked set is empty.
        loop {
            let pids: Vec<Pid> = self.lock_state().child_pids.clone();
            if pids.is_empty() {
                break;
            }
            for pid in pids {
                self.stop_child(&cfg, pid);
                self.forget(pid);
            }
        }

        self.stop_requested.store(false, Ordering::Relaxed);
        self.logger
            .info("stop", Some(&self.name), "outcome=stopped");
        Ok(())
    }

    /// Caller holds the ops mutex. LIFO: newest instance goes first.
    fn stop_one_locked(&self) -> Result<()> {
        let cfg = self.config_snapshot();
        let Some(pid) = self.lock_state().child_pids.pop() else {
            return Ok(());
        };
        // The pid is no longer tracked, so the monitor cannot race this
        // reap; suppress covers the window where it already snapshotted it.
        let was = self.suppress_auto_restart.swap(true, Ordering::Relaxed);
        self.stop_child(&cfg, pid);
        self.suppress_auto_restart.store(was, Ordering::Relaxed);
        self.logger
            .info("stop", Some(&self.name), format!("instance pid={pid} stopped"));
        Ok(())
    }

    /// Graceful-then-forceful termination of one child. Returns once the
    /// child is reaped or confirmed gone.
    fn stop_child(&self, cfg: &ProgramConfig, pid: Pid) {
        let sig = cfg.stop_signal.signal();
        for _ in 0..cfg.stop_time {
            match kill(pid, sig) {
                Err(Errno::ESRCH) => {
                    self.try_reap(pid);
                    self.logger
                        .info("stop", Some(&self.name), format!("pid={pid} already gone"));
                    return;
                }
                Err(e) => {
                    let err = SupervisorError::StopFailed {
                        program: self.name.clone(),
                        pid: pid.as_raw(),
                        message: e.to_string(),
                    };
                    self.logger.error(
                        "stop",
                        Some(&self.name),
                        format!("{}: {err}; forcing termination", err.as_label()),
                    );
                    break;
                }
                Ok(()) => {}
            }
            for _ in 0..REAP_TICKS_PER_SEND {
                if self.try_reap(pid) {
                    self.logger.info(
                        "stop",
                        Some(&self.name),
                        format!(
                            "pid={pid} outcome=graceful_exit sig={}",
                            cfg.stop_signal.as_str()
                        ),
                    );
                    return;
                }
                thread::sleep(REAP_TICK);
            }
        }

        self.logger.info(
            "stop",
            Some(&self.name),
            format!("pid={pid} grace budget exhausted; forcing termination"),
        );
        let _ = kill(pid, Signal::SIGKILL);
        loop {
            if self.try_reap(pid) {
                break;
            }
            thread::sleep(REAP_TICK);
        }
        self.logger
            .info("stop", Some(&self.name), format!("pid={pid} outcome=killed"));
    }

    /// Non-blocking reap. True when the child no longer exists.
    fn try_reap(&self, pid: Pid) -> bool {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) => true,
            // ECHILD: reaped elsewhere (monitor raced us).
            Err(_) => true,
        }
    }
}

// Lifecycle paths below take the shared state by Arc because they may hand
// an owned reference to a freshly spawned monitor worker.

/// Caller holds the ops mutex.
fn start_locked(shared: &Arc<Shared>) -> Result<()> {
    let cfg = shared.config_snapshot();
    if cfg.instances < 1 {
        return Err(SupervisorError::invalid_config(
            &shared.name,
            "instances: must be >= 1 to start",
        ));
    }
    shared.failed.store(false, Ordering::Relaxed);
    shared.suppress_auto_restart.store(true, Ordering::Relaxed);

    let total = cfg.restart_attempts + 1;
    for attempt in 1..=total {
        if shared.stop_requested.load(Ordering::Relaxed) {
            shared
                .logger
                .info("start", Some(&shared.name), "aborted: stop requested");
            return Ok(());
        }

        // Fixed count per attempt: the monitor may reap concurrently, and
        // chasing a moving target would spawn without bound for
        // instantly-dying commands.
        let missing = (cfg.instances as usize).saturating_sub(shared.running_count());
        let mut spawn_failed = false;
        for _ in 0..missing {
            match shared.spawn_instance(&cfg) {
                Ok(pid) => {
                    shared.lock_state().child_pids.push(pid);
                    shared.logger.info(
                        "start",
                        Some(&shared.name),
                        format!("attempt={attempt}/{total} spawned pid={pid}"),
                    );
                }
                Err(e) => {
                    shared.logger.error(
                        "start",
                        Some(&shared.name),
                        format!("attempt={attempt}/{total} {}: {e}", e.as_label()),
                    );
                    spawn_failed = true;
                    break;
                }
            }
        }
        ensure_monitor(shared);

        if !spawn_failed {
            // A child counts as started once it has survived the start_time
            // window; reap between ticks so early exits are observed even
            // when this runs on the monitor thread.
            let mut waited = 0;
            while waited < cfg.start_time {
                thread::sleep(Duration::from_secs(1));
                waited += 1;
                poll_children_once(shared);
                if shared.fully_running(&cfg) || shared.stop_requested.load(Ordering::Relaxed) {
                    break;
                }
            }
            if shared.fully_running(&cfg) {
                shared.suppress_auto_restart.store(false, Ordering::Relaxed);
                shared.logger.info(
                    "start",
                    Some(&shared.name),
                    format!("outcome=running instances={}", cfg.instances),
                );
                return Ok(());
            }
        }

        shared.logger.error(
            "start",
            Some(&shared.name),
            format!(
                "attempt={attempt}/{total} failed ({} of {} running)",
                shared.running_count(),
                cfg.instances
            ),
        );
    }

    shared.stop_locked()?;
    shared.failed.store(true, Ordering::Relaxed);
    Err(SupervisorError::StartExhausted {
        program: shared.name.clone(),
        attempts: total,
    })
}

/// Caller holds the ops mutex. Converge the running count to the target
/// without disturbing surviving instances.
fn scale_locked(shared: &Arc<Shared>) -> Result<()> {
    let cfg = shared.config_snapshot();
    let target = cfg.instances as usize;
    let running = shared.running_count();

    if running == 0 && !shared.monitor_active.load(Ordering::Relaxed) {
        // Program is idle; the new target applies at the next start.
        shared.logger.info(
            "scale",
            Some(&shared.name),
            format!("target={target} recorded (program not running)"),
        );
        return Ok(());
    }

    let missing = target.saturating_sub(running);
    for _ in 0..missing {
        let pid = shared.spawn_instance(&cfg).map_err(|e| {
            shared
                .logger
                .error("scale", Some(&shared.name), format!("{}: {e}", e.as_label()));
            e
        })?;
        shared.lock_state().child_pids.push(pid);
        shared
            .logger
            .info("scale", Some(&shared.name), format!("spawned pid={pid}"));
    }
    ensure_monitor(shared);
    let excess = running.saturating_sub(target);
    for _ in 0..excess {
        shared.stop_one_locked()?;
    }
    shared.logger.info(
        "scale",
        Some(&shared.name),
        format!("outcome=scaled instances={target}"),
    );
    Ok(())
}

/// Spawn the monitor worker unless one is already active. Caller holds the
/// ops mutex.
fn ensure_monitor(shared: &Arc<Shared>) {
    if shared.monitor_active.swap(true, Ordering::Relaxed) {
        return;
    }
    // A previous worker has exited; collect its handle first.
    if let Some(h) = shared.lock_state().monitor.take() {
        let _ = h.join();
    }
    let worker = Arc::clone(shared);
    let handle = thread::spawn(move || monitor_loop(worker));
    shared.lock_state().monitor = Some(handle);
}

fn monitor_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop_requested.load(Ordering::Relaxed) {
            break;
        }
        poll_children_once(&shared);
        if shared.stop_requested.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(MONITOR_POLL);
    }
    shared.monitor_active.store(false, Ordering::Relaxed);
}

/// One reap pass over the tracked pids. The state mutex is held only around
/// snapshot and removal, never across a wait or a sleep.
fn poll_children_once(shared: &Arc<Shared>) {
    let pids: Vec<Pid> = shared.lock_state().child_pids.clone();
    for pid in pids {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                shared.forget(pid);
                handle_child_exit(shared, pid, ExitOutcome::Exited(code));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                shared.forget(pid);
                handle_child_exit(shared, pid, ExitOutcome::Signaled(sig));
            }
            Ok(other) => {
                shared.logger.error(
                    "monitor",
                    Some(&shared.name),
                    format!("pid={pid} unexpected wait result: {other:?}"),
                );
            }
            Err(Errno::ECHILD) => {
                shared.forget(pid);
                handle_child_exit(shared, pid, ExitOutcome::Unknown);
            }
            Err(e) => {
                shared.logger.error(
                    "monitor",
                    Some(&shared.name),
                    format!("pid={pid} wait error: {e}"),
                );
            }
        }
    }
}

/// Restart policy dispatch for one reaped child.
fn handle_child_exit(shared: &Arc<Shared>, pid: Pid, outcome: ExitOutcome) {
    let cfg = shared.config_snapshot();
    shared.logger.info(
        "monitor",
        Some(&shared.name),
        format!("reaped pid={pid} {outcome}"),
    );

    if shared.suppress_auto_restart.load(Ordering::Relaxed) {
        return;
    }
    let relaunch = match cfg.auto_restart {
        AutoRestart::Always => true,
        AutoRestart::Never => false,
        AutoRestart::Unexpected => !outcome.is_expected(&cfg),
    };
    if !relaunch || shared.stop_requested.load(Ordering::Relaxed) {
        return;
    }

    shared.logger.info(
        "monitor",
        Some(&shared.name),
        format!("decision=restart policy={}", cfg.auto_restart.as_str()),
    );
    let restart = |shared: &Arc<Shared>| {
        if let Err(e) = start_locked(shared) {
            shared
                .logger
                .error("start", Some(&shared.name), format!("{}: {e}", e.as_label()));
        }
    };
    match shared.ops.try_lock() {
        Ok(_guard) => restart(shared),
        Err(TryLockError::Poisoned(p)) => {
            let _guard = p.into_inner();
            restart(shared);
        }
        Err(TryLockError::WouldBlock) => {
            // Another lifecycle operation is in flight; it owns the
            // transition.
            shared.logger.info(
                "monitor",
                Some(&shared.name),
                "restart skipped: lifecycle operation in flight",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::config::StopSignal;

    fn idle_config(name: &str, instances: u32) -> ProgramConfig {
        ProgramConfig {
            name: name.to_string(),
            command: vec!["/bin/true".to_string()],
            instances,
            auto_start: false,
            auto_restart: AutoRestart::Never,
            start_time: 0,
            stop_time: 1,
            restart_attempts: 0,
            stop_signal: StopSignal::Term,
            expected_exit_codes: [0].into_iter().collect(),
            working_directory: "/".into(),
            umask: None,
            stdout_log: "/dev/null".into(),
            stderr_log: "/dev/null".into(),
            environment: Default::default(),
        }
    }

    #[test]
    fn start_with_zero_instances_is_invalid() {
        let p = Program::new(idle_config("noop", 0), Arc::new(Logger::stdio()));
        let err = p.start().unwrap_err();
        assert_eq!(err.as_label(), "invalid_config");
        assert_eq!(p.phase(), Phase::Idle);
    }

    #[test]
    fn stop_on_idle_program_is_a_no_op() {
        let p = Program::new(idle_config("noop", 1), Arc::new(Logger::stdio()));
        assert!(p.stop().is_ok());
        assert!(p.stop().is_ok());
        assert_eq!(p.running_instance_count(), 0);
    }

    #[test]
    fn status_line_reports_counts() {
        let p = Program::new(idle_config("noop", 2), Arc::new(Logger::stdio()));
        assert_eq!(p.status_line(), "0 out of 2 instances running");
    }

    #[test]
    fn reload_without_changes_is_a_no_op() {
        let cfg = idle_config("noop", 1);
        let p = Program::new(cfg.clone(), Arc::new(Logger::stdio()));
        assert!(p.reload(cfg).is_ok());
        assert_eq!(p.phase(), Phase::Idle);
    }

    #[test]
    fn exit_outcome_classification() {
        let mut cfg = idle_config("noop", 1);
        cfg.expected_exit_codes = [0, 2].into_iter().collect();
        assert!(ExitOutcome::Exited(0).is_expected(&cfg));
        assert!(ExitOutcome::Exited(2).is_expected(&cfg));
        assert!(!ExitOutcome::Exited(7).is_expected(&cfg));
        assert!(!ExitOutcome::Signaled(Signal::SIGTERM).is_expected(&cfg));
        assert!(!ExitOutcome::Unknown.is_expected(&cfg));
    }
}
