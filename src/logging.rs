//! Logging setup: stdout plus a dated log file.
//!
//! The filter level comes from `RUST_LOG` when set, otherwise from the
//! `[logging]` section. When a log directory is configured, output is
//! tee'd to `fieldnode-YYYYMMDD.log` inside it (dated at startup — a
//! field node reboots at least daily, so each wake cycle gets its day's
//! file).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber.
pub fn init(cfg: &LoggingConfig) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());

    let log_file = cfg.directory.as_deref().and_then(open_dated_log);
    match log_file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(log_filter)
                .with_ansi(false)
                .with_writer(TeeMakeWriter {
                    file: Arc::new(Mutex::new(file)),
                })
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(log_filter).init();
        }
    }
}

fn open_dated_log(directory: &str) -> Option<File> {
    let dir = Path::new(directory);
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Cannot create log directory {directory}: {e}");
        return None;
    }
    let path = dir.join(format!("fieldnode-{}.log", Utc::now().format("%Y%m%d")));
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Cannot open log file {}: {e}", path.display());
            None
        }
    }
}

struct TeeMakeWriter {
    file: Arc<Mutex<File>>,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: Arc::clone(&self.file),
        }
    }
}

struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Losing a log line to a full disk must not take the process down.
        let _ = io::stdout().write_all(buf);
        let _ = self.file.lock().write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        let _ = self.file.lock().flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_dated_log_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        let file = open_dated_log(nested.to_str().unwrap());
        assert!(file.is_some());

        let entries: Vec<_> = std::fs::read_dir(&nested).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_string_lossy().into_owned();
        assert!(name.starts_with("fieldnode-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_tee_writer_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let mut writer = TeeWriter {
            file: Arc::new(Mutex::new(file)),
        };
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
