//! Supervisor controller: the program registry and the operator loop.
//!
//! The controller owns every `Program` exclusively and runs on the main
//! thread, blocking on operator input. Signal intents are observed between
//! loop iterations, never from signal context. Program-scoped errors are
//! logged with the program name and the loop keeps running; only EOF,
//! `exit`, or a shutdown intent terminate it.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::tm::command::Command;
use crate::tm::config::{self, Config};
use crate::tm::error::{Result, SupervisorError};
use crate::tm::logger::Logger;
use crate::tm::program::Program;
use crate::tm::signals::Intents;

enum Flow {
    Continue,
    Exit,
}

pub struct Controller {
    config_path: PathBuf,
    logger: Arc<Logger>,
    intents: Intents,
    programs: BTreeMap<String, Program>,
}

impl Controller {
    pub fn new(config_path: PathBuf, logger: Arc<Logger>, intents: Intents) -> Controller {
        Controller {
            config_path,
            logger,
            intents,
            programs: BTreeMap::new(),
        }
    }

    /// Construct one Program per configured entry, then auto-start. A
    /// terminal auto-start failure rolls back (stops what was started) and
    /// aborts boot.
    pub fn initialize(&mut self, config: &Config) -> Result<()> {
        for (name, cfg) in &config.programs {
            self.logger.info(
                "init",
                Some(name),
                format!("registered instances={} auto_start={}", cfg.instances, cfg.auto_start),
            );
            self.programs
                .insert(name.clone(), Program::new(cfg.clone(), Arc::clone(&self.logger)));
        }
        for (name, program) in &self.programs {
            if !program.auto_start() {
                continue;
            }
            if let Err(e) = program.start() {
                self.logger
                    .error("init", Some(name), format!("auto-start failed: {e}"));
                self.stop_all();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Line-oriented read-eval loop on the operator input stream. Returns
    /// after a graceful shutdown (exit, EOF, or shutdown signal).
    pub fn run_command_loop(&mut self, mut input: impl BufRead) {
        loop {
            if self.drain_intents() {
                break;
            }
            print!("taskmaster> ");
            let _ = std::io::stdout().flush();

            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) => {
                    self.logger.info("controller", None, "eof: shutting down");
                    self.stop_all();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.logger
                        .error("controller", None, format!("input error: {e}; shutting down"));
                    self.stop_all();
                    break;
                }
            }
            // A signal may have arrived while blocked on the read.
            if self.drain_intents() {
                break;
            }
            match self.handle_line(&line) {
                Flow::Continue => {}
                Flow::Exit => {
                    self.stop_all();
                    break;
                }
            }
        }
    }

    /// Act on pending signal intents. True when shutdown was performed.
    fn drain_intents(&mut self) -> bool {
        if self.intents.shutdown_requested() {
            self.logger
                .info("signal", None, "shutdown requested; stopping all programs");
            self.stop_all();
            return true;
        }
        if self.intents.take_reload() {
            self.logger.info("signal", None, "reload requested");
            self.reload_config();
        }
        false
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        match Command::parse(line) {
            Ok(None) => Flow::Continue,
            Ok(Some(cmd)) => self.dispatch(cmd),
            Err(e) => {
                self.logger
                    .error("command", None, format!("{}: {e}", e.as_label()));
                Flow::Continue
            }
        }
    }

    fn dispatch(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Status => self.status(),
            Command::Start(name) => self.start_one(&name),
            Command::Stop(name) => self.stop_one(&name),
            Command::Restart(name) => self.restart_one(&name),
            Command::Reload => self.reload_config(),
            Command::Help => self.logger.info("controller", None, Command::usage_text()),
            Command::Exit => return Flow::Exit,
        }
        Flow::Continue
    }

    pub fn start_one(&self, name: &str) {
        self.run_on(name, "start", |p| p.start());
    }

    pub fn stop_one(&self, name: &str) {
        self.run_on(name, "stop", |p| p.stop());
    }

    pub fn restart_one(&self, name: &str) {
        self.run_on(name, "restart", |p| {
            p.stop()?;
            p.start()
        });
    }

    fn run_on(&self, name: &str, what: &str, op: impl FnOnce(&Program) -> Result<()>) {
        let Some(program) = self.programs.get(name) else {
            let e = SupervisorError::NotFound {
                name: name.to_string(),
            };
            self.logger.error(what, None, format!("{}: {e}", e.as_label()));
            return;
        };
        match op(program) {
            Ok(()) => self.logger.info(what, Some(name), "ok"),
            Err(e) => self
                .logger
                .error(what, Some(name), format!("{}: {e}", e.as_label())),
        }
    }

    /// One line per program, through the logger.
    pub fn status(&self) {
        for line in self.status_lines() {
            self.logger.info("status", None, line);
        }
    }

    pub fn status_lines(&self) -> Vec<String> {
        self.programs
            .iter()
            .map(|(name, p)| format!("{name}: {}", p.status_line()))
            .collect()
    }

    pub fn program_names(&self) -> Vec<String> {
        self.programs.keys().cloned().collect()
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    /// Re-read the configuration and converge the registry: reload entries
    /// present in both, add-and-maybe-start new ones, stop-and-remove the
    /// rest. A failed read/parse rejects the whole reload.
    pub fn reload_config(&mut self) {
        let config = match config::load_config(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                self.logger
                    .error("reload", None, format!("rejected: {e}"));
                return;
            }
        };

        for (name, cfg) in &config.programs {
            match self.programs.get(name) {
                Some(program) => {
                    if let Err(e) = program.reload(cfg.clone()) {
                        self.logger
                            .error("reload", Some(name), format!("{}: {e}", e.as_label()));
                    }
                }
                None => {
                    let program = Program::new(cfg.clone(), Arc::clone(&self.logger));
                    self.logger.info("reload", Some(name), "added");
                    if cfg.auto_start {
                        if let Err(e) = program.start() {
                            self.logger
                                .error("reload", Some(name), format!("{}: {e}", e.as_label()));
                        }
                    }
                    self.programs.insert(name.clone(), program);
                }
            }
        }

        let removed: Vec<String> = self
            .programs
            .keys()
            .filter(|name| !config.programs.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(program) = self.programs.remove(&name) {
                if let Err(e) = program.stop() {
                    self.logger
                        .error("reload", Some(&name), format!("{}: {e}", e.as_label()));
                }
                self.logger.info("reload", Some(&name), "removed");
            }
        }
    }

    /// Stop every registered program. Safe to call repeatedly.
    pub fn stop_all(&self) {
        for (name, program) in &self.programs {
            if let Err(e) = program.stop() {
                self.logger
                    .error("stop", Some(name), format!("{}: {e}", e.as_label()));
            }
        }
    }
}
