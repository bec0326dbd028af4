//! Logging configuration for monthly-extract.
//!
//! Logs always go to stderr. They are also appended to a log file so that
//! scheduled runs leave a history behind.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes logging to stderr and, when possible, to `log_file`.
///
/// Falls back to the default log path when `log_file` is `None`. Returns the
/// file actually used, or `None` if it could not be opened.
pub fn init(log_file: Option<&Path>) -> Option<PathBuf> {
    let path = log_file.map(Path::to_path_buf).unwrap_or_else(get_log_path);

    let file = match open_log_file(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Warning: Could not open log file {}: {e}", path.display());
            None
        }
    };
    let opened = file.is_some();

    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    });

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();

    opened.then_some(path)
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Returns the default log file path.
///
/// Uses the XDG state directory on Linux (`~/.local/state/monthly-extract/automation.log`),
/// or falls back to the config directory on other platforms.
pub fn get_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("monthly-extract").join("automation.log");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("monthly-extract").join("automation.log");
    }

    std::env::temp_dir().join("monthly-extract-automation.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_is_absolute() {
        assert!(get_log_path().is_absolute());
    }

    #[test]
    fn test_log_path_ends_with_automation_log() {
        assert!(get_log_path()
            .to_string_lossy()
            .ends_with("automation.log"));
    }

    #[test]
    fn test_log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("automation.log");

        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "first run").unwrap();
        }
        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "second run").unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first run\nsecond run\n");
    }
}
