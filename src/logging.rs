//! Subscriber setup for the binary. The library only emits events.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, Level};

/// Where and how much to log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    /// Append here instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: Level::WARN, file: None }
    }
}

/// Unknown names fall back to `warn`
pub fn parse_log_level(s: &str) -> Level {
    match s.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

/// Install the global fmt subscriber.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init(settings: &LogSettings) -> Result<(), String> {
    let builder = tracing_subscriber::fmt().with_max_level(settings.level).with_target(false);

    match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create log directory {}: {}", parent.display(), e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| format!("Failed to install logger: {}", e))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| format!("Failed to install logger: {}", e))?;
        }
    }

    info!(level = %settings.level, file = ?settings.file, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug"), Level::DEBUG);
        assert_eq!(parse_log_level(" INFO "), Level::INFO);
        assert_eq!(parse_log_level("error"), Level::ERROR);
        assert_eq!(parse_log_level("loud"), Level::WARN);
    }

    #[test]
    fn test_default_is_warn_to_stderr() {
        let settings = LogSettings::default();
        assert_eq!(settings.level, Level::WARN);
        assert!(settings.file.is_none());
    }
}
