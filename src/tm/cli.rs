use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "taskmaster", version, about = "interactive process supervisor")]
pub struct Args {
    /// Path to the supervisor configuration file (YAML)
    pub config: PathBuf,
}

/// Boot banner logged before the command loop takes over.
pub fn banner() -> String {
    let built = option_env!("TASKMASTER_BUILD_EPOCH")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("taskmaster {} (built {built})", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_names_the_crate_version() {
        let b = banner();
        assert!(b.starts_with("taskmaster "));
        assert!(b.contains(env!("CARGO_PKG_VERSION")));
        assert!(!b.contains("built unknown"));
    }
}
