//! Append-only text logger shared by every component.
//!
//! One `Logger` is constructed at boot from the top-level config and handed
//! around as `Arc<Logger>`. Info lines echo to stdout and error lines to
//! stderr; when file logging is enabled both are also appended to the
//! configured sink. The file handle is held behind a mutex; writers never
//! hold it across anything but the write itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;

pub struct Logger {
    sink: Mutex<Option<File>>,
}

impl Logger {
    /// Logger that only echoes to stdout/stderr.
    pub fn stdio() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    /// Logger with a file sink (append, create if missing).
    pub fn with_file(path: &Path) -> std::io::Result<Logger> {
        let f = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Logger {
            sink: Mutex::new(Some(f)),
        })
    }

    pub fn info(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        let line = render(component, program, msg.as_ref());
        println!("{line}");
        self.append(&line);
    }

    pub fn error(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        let line = format!("[ERROR] {}", render(component, program, msg.as_ref()));
        eprintln!("{line}");
        self.append(&line);
    }

    fn append(&self, line: &str) {
        let mut g = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(f) = g.as_mut() {
            let _ = writeln!(f, "{line}");
        }
    }
}

fn render(component: &str, program: Option<&str>, msg: &str) -> String {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match program {
        Some(p) => format!("{ts} [{component}] program={p} {msg}"),
        None => format!("{ts} [{component}] {msg}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_appends_both_levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskmaster.log");
        let logger = Logger::with_file(&path).unwrap();
        logger.info("boot", None, "starting");
        logger.error("start", Some("web"), "attempt=1 outcome=spawn_failed");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[boot] starting"));
        assert!(text.contains("[ERROR]"));
        assert!(text.contains("program=web"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn stdio_logger_has_no_sink() {
        let logger = Logger::stdio();
        logger.info("boot", None, "no file configured");
        assert!(logger.sink.lock().unwrap().is_none());
    }
}
