//! Logging setup
//!
//! `env_logger` backend with an optional tee into daily files
//! (`logs/server-YYYY-MM-DD.log`) and a retention sweep that runs at startup
//! and every 24 hours.

use chrono::{Local, NaiveDate};
use log::{info, warn};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{LoggingConfig, PathsConfig};

const LOG_FILE_PREFIX: &str = "server-";
const LOG_FILE_SUFFIX: &str = ".log";

/// Initialize the global logger.
///
/// Without file logging this is a plain `env_logger` writing to stderr; with
/// it, every formatted line is mirrored into the current daily file.
pub fn init(
    logging: &LoggingConfig,
    paths: &PathsConfig,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    let mut builder = env_logger::Builder::from_env(env);

    if logging.enable_file_log {
        fs::create_dir_all(&paths.log_dir)?;
        let writer = TeeWriter::new(paths.log_dir.clone());
        builder.target(env_logger::Target::Pipe(Box::new(writer)));
    }

    builder.init();
    Ok(())
}

/// Spawn the daily retention sweep. Runs once immediately, then every 24 h.
pub fn spawn_retention_task(log_dir: PathBuf, retention_days: u32) {
    tokio::spawn(async move {
        loop {
            match sweep_old_logs(&log_dir, retention_days) {
                Ok(0) => {}
                Ok(n) => info!("Log rotation removed {} expired file(s)", n),
                Err(e) => warn!("Log rotation sweep failed: {}", e),
            }
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
    });
}

/// Delete `server-YYYY-MM-DD.log` files older than the retention window.
/// Returns the number of files removed.
pub fn sweep_old_logs(dir: &Path, retention_days: u32) -> io::Result<usize> {
    let cutoff = Local::now().date_naive() - chrono::Days::new(retention_days as u64);
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date) = parse_log_date(name) else {
            continue;
        };
        if date < cutoff {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Failed to remove expired log {}: {}", name, e);
            } else {
                removed += 1;
            }
        }
    }

    Ok(removed)
}

fn parse_log_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

fn log_file_name(date: NaiveDate) -> String {
    format!("{}{}{}", LOG_FILE_PREFIX, date.format("%Y-%m-%d"), LOG_FILE_SUFFIX)
}

/// Writes each chunk to stderr and to the current daily file, switching
/// files when the local date changes.
struct TeeWriter {
    inner: Mutex<DailyFile>,
}

struct DailyFile {
    dir: PathBuf,
    date: NaiveDate,
    file: Option<File>,
}

impl TeeWriter {
    fn new(dir: PathBuf) -> Self {
        Self {
            inner: Mutex::new(DailyFile {
                dir,
                date: Local::now().date_naive(),
                file: None,
            }),
        }
    }
}

impl DailyFile {
    fn current(&mut self) -> io::Result<&mut File> {
        let today = Local::now().date_naive();
        if self.file.is_none() || self.date != today {
            let path = self.dir.join(log_file_name(today));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.date = today;
            return Ok(self.file.insert(file));
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::other("log file not open")),
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        let mut daily = self.inner.lock();
        if let Ok(file) = daily.current() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        let mut daily = self.inner.lock();
        if let Some(file) = daily.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_log_names() {
        assert_eq!(
            parse_log_date("server-2026-08-01.log"),
            NaiveDate::from_ymd_opt(2026, 8, 1)
        );
        assert_eq!(parse_log_date("server-notadate.log"), None);
        assert_eq!(parse_log_date("other-2026-08-01.log"), None);
    }

    #[test]
    fn sweep_removes_only_expired_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = Local::now().date_naive() - chrono::Days::new(30);
        let today = Local::now().date_naive();

        fs::write(dir.path().join(log_file_name(old)), b"old").unwrap();
        fs::write(dir.path().join(log_file_name(today)), b"new").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        let removed = sweep_old_logs(dir.path(), 14).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join(log_file_name(today)).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
