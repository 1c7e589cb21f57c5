use std::io;
use std::sync::Arc;

use clap::Parser;

use taskmaster::tm::cli::{self, Args};
use taskmaster::tm::command::Command;
use taskmaster::tm::config;
use taskmaster::tm::controller::Controller;
use taskmaster::tm::logger::Logger;
use taskmaster::tm::signals::Intents;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Fail fast: a broken config or an unopenable log sink is fatal (exit 1).
    let cfg = config::load_config(&args.config)?;
    let logger = if cfg.logging_enabled {
        Logger::with_file(&cfg.log_file).map_err(|e| {
            anyhow::anyhow!("failed to open log file {}: {e}", cfg.log_file.display())
        })?
    } else {
        Logger::stdio()
    };
    let logger = Arc::new(logger);

    logger.info("boot", None, cli::banner());
    logger.info(
        "boot",
        None,
        format!("config={} programs={}", args.config.display(), cfg.programs.len()),
    );
    logger.info("controller", None, Command::usage_text());

    let intents = Intents::install()?;
    let mut controller = Controller::new(args.config, logger, intents);
    controller.initialize(&cfg)?;
    controller.run_command_loop(io::stdin().lock());
    Ok(())
}
