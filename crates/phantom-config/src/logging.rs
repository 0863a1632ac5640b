//! Tracing initialization.
//!
//! One subscriber per process, set up in `main`. Events go to a log file
//! under `.gvfs/logs/` (falling back to stderr if the directory is not
//! writable). `RUST_LOG` overrides the default filter. Telemetry-grade
//! events use `target: "telemetry"` so a forwarding sink can match on it.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

/// Target name for events a telemetry sink should pick up.
pub const TELEMETRY_TARGET: &str = "telemetry";

/// Initializes the global subscriber. Call once at startup; returns the
/// log file path when file logging engaged.
pub fn init_logging(log_dir: &Path, component: &str) -> Option<std::path::PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,phantom=debug"));

    if fs::create_dir_all(log_dir).is_ok() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = log_dir.join(format!("{component}_{stamp}.log"));
        if let Ok(file) = File::create(&path) {
            let writer = Arc::new(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .init();
            return Some(path);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    None
}
