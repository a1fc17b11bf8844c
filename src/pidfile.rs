//! Exclusive PID file.
//!
//! Holds an advisory exclusive lock for the lifetime of the process so a
//! second instance refuses to start, and removes the file again on drop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("pid file {path} is already held by another process")]
    Held { path: String },
    #[error("pid file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create (or reuse) the file at `path`, take an exclusive lock, and
    /// write our PID into it.
    pub fn acquire(path: &str) -> Result<Self, PidFileError> {
        let io_err = |source| PidFileError::Io {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                debug!("Creating directory {} for PID file", parent.display());
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(PidFileError::Held {
                path: path.to_string(),
            });
        }

        file.set_len(0).map_err(io_err)?;
        write!(file, "{}", std::process::id()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        Ok(Self {
            path: PathBuf::from(path),
            file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove pid file {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldnode.pid");
        let path_str = path.to_str().unwrap();

        {
            let _pid = PidFile::acquire(path_str).unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldnode.pid");
        let path_str = path.to_str().unwrap();

        let _held = PidFile::acquire(path_str).unwrap();
        assert!(matches!(
            PidFile::acquire(path_str),
            Err(PidFileError::Held { .. })
        ));
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("fieldnode.pid");
        let _pid = PidFile::acquire(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
    }
}
