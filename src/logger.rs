//! Session logger: `tracing` output to stderr plus a per-session log file.
//!
//! The file is **truncated (overwritten) at each launch**, so it only ever
//! contains output from the most-recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\KnouxStudio\knoux.log`
//!   Linux:    `~/.local/share/KnouxStudio/knoux.log`
//!   macOS:    `~/Library/Application Support/KnouxStudio/knoux.log`
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the level
//! passed to [`init`].

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool, configured: &str) -> String {
    if verbose {
        "debug".to_string()
    } else if configured.trim().is_empty() {
        "info".to_string()
    } else {
        configured.trim().to_string()
    }
}

/// Initialise logging. Safe to call more than once; later calls are no-ops.
///
/// * Creates (or truncates) the session log file.
/// * Installs a panic hook that records the panic before the default handler runs.
pub fn init(verbose: bool, configured_level: &str) {
    let directive = default_directive(verbose, configured_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let file_layer = open_log_file().map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file))
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    if let Some(path) = log_path() {
        tracing::debug!(log_file = %path.display(), "session log opened");
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC: {info}");
        prev(info);
    }));
}

fn open_log_file() -> Option<File> {
    let path = log_file_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => {
            let _ = LOG_PATH.set(path);
            Some(f)
        }
        Err(e) => {
            // Not fatal, stderr output still works
            eprintln!("[logger] Failed to open log file {}: {e}", path.display());
            None
        }
    }
}

fn log_file_path() -> PathBuf {
    data_dir().join("KnouxStudio").join("knoux.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    // Linux / fallback
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}
