//! Logging setup.
//!
//! The library only emits `tracing` events; embedding applications decide
//! where they go. These helpers install a `tracing-subscriber` formatter
//! writing to `~/.tasknet/tasknet.log`, or to stderr when no home directory
//! is available.
//!
//! Filter precedence: `RUST_LOG`, then debug mode (`--debug` style flag or
//! `TASKNET_DEBUG=1`), then `info`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEBUG_FILTER: &str = "tasknet=debug,info";
const DEFAULT_FILTER: &str = "info";

/// Initialize logging with debug mode taken from the environment.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Later calls are no-ops, as is calling this after another subscriber was
/// installed.
pub fn init_with_debug(debug: bool) {
    let filter = env_filter(debug || env_debug());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    match log_file() {
        Some(file) => {
            let _ = builder.with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Path of the log file, if a home directory exists.
pub fn log_path() -> Option<PathBuf> {
    Config::tasknet_dir().ok().map(|dir| dir.join("tasknet.log"))
}

fn env_debug() -> bool {
    std::env::var("TASKNET_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_filter(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(default_directive(debug))
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    }
}

// Truncated on startup.
fn log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}
