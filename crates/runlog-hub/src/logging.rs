use crate::config::Config;
use chrono::{NaiveDate, Utc};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "runlog-hub";

/// Where log lines go besides stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTarget {
    pub file: Option<PathBuf>,
}

/// Installs the global subscriber: stdout, plus one plain-text file per UTC
/// day under the configured log dir. `RUST_LOG` overrides the level.
pub fn init_logging(config: &Config) -> LogTarget {
    let directive = default_directive(config.debug, std::env::var("RUNLOG_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let (file, setup_error) = match open_log_file(&config.log_dir, Utc::now().date_naive()) {
        Ok(opened) => (opened, None),
        Err(err) => (None, Some(err)),
    };
    let target = LogTarget {
        file: file.as_ref().map(|(path, _)| path.clone()),
    };
    let file_layer = file.map(|(_, file)| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file))
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
    if installed.is_ok() {
        if let Some(err) = setup_error {
            warn!(event = "log_file_error", log_dir = %config.log_dir, error = %err);
        }
    }
    target
}

/// `--debug` wins over `RUNLOG_LOG_LEVEL`; blank levels fall back to info.
fn default_directive(debug: bool, level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    level
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn log_file_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("{LOG_FILE_PREFIX}.{}.log", day.format("%Y-%m-%d")))
}

fn open_log_file(log_dir: &str, day: NaiveDate) -> io::Result<Option<(PathBuf, File)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir.trim());
    std::fs::create_dir_all(&dir)?;
    let path = log_file_path(&dir, day);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date")
    }

    #[test]
    fn log_file_is_dated_and_appended_across_restarts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log_dir = dir.path().join("nested");
        let log_dir = log_dir.to_str().expect("utf8 path");

        for line in ["event=hub_start\n", "event=hub_shutdown\n"] {
            let (path, mut file) = open_log_file(log_dir, day())
                .expect("open log")
                .expect("file enabled");
            assert!(path.ends_with("runlog-hub.2026-03-14.log"));
            file.write_all(line.as_bytes()).expect("write");
        }

        let contents = std::fs::read_to_string(log_file_path(Path::new(log_dir), day()))
            .expect("read log");
        assert_eq!(contents, "event=hub_start\nevent=hub_shutdown\n");
    }

    #[test]
    fn blank_log_dir_disables_file_output() {
        assert!(open_log_file("  ", day()).expect("no file").is_none());
    }

    #[test]
    fn debug_flag_outranks_configured_level() {
        assert_eq!(default_directive(true, Some("warn".to_string())), "debug");
        assert_eq!(default_directive(false, Some(" warn ".to_string())), "warn");
        assert_eq!(default_directive(false, Some(String::new())), "info");
        assert_eq!(default_directive(false, None), "info");
    }
}
