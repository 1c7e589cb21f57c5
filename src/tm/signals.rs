//! Process-level signal router.
//!
//! Handlers do nothing but store into an atomic flag; every consequence
//! (reload, shutdown) runs on the controller thread when it checks the
//! intents between command-loop iterations. Lifecycle code is never entered
//! from signal context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

/// Intent flags set asynchronously by signals, drained by the controller.
#[derive(Clone)]
pub struct Intents {
    reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Intents {
    /// Flags without handlers installed (tests, embedding).
    pub fn detached() -> Intents {
        Intents {
            reload: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the process-wide handlers: SIGHUP requests a reload,
    /// SIGINT/SIGQUIT/SIGTERM request shutdown.
    pub fn install() -> std::io::Result<Intents> {
        let intents = Intents::detached();
        signal_hook::flag::register(SIGHUP, Arc::clone(&intents.reload))?;
        for sig in [SIGINT, SIGQUIT, SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&intents.shutdown))?;
        }
        Ok(intents)
    }

    /// True once any shutdown signal has arrived. Sticky.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Consume a pending reload request, clearing the flag.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
