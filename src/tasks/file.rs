//! File sender task.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::modem::Connection;
use crate::tasks::{check_keys, Outcome, RunContext, Task, TaskError};

/// Enqueues files for transfer over the next RUDICS data call. As a
/// follow-on it ships the invoking task's output files; scheduled directly
/// it ships the configured `path`.
pub struct FileSender {
    path: Option<PathBuf>,
    connection: Arc<dyn Connection>,
}

impl FileSender {
    pub fn new(
        args: &BTreeMap<String, String>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, String> {
        check_keys(args, &["path"])?;
        Ok(Self {
            path: args.get("path").map(PathBuf::from),
            connection,
        })
    }

    fn files_to_send(&self, ctx: &RunContext) -> Result<Vec<PathBuf>, TaskError> {
        if let Some(invoking) = &ctx.invoking {
            let output = invoking.output();
            if !output.is_empty() {
                return Ok(output);
            }
            warn!("Invoking task {} produced no output files", invoking.id);
        }
        match &self.path {
            Some(path) => Ok(vec![path.clone()]),
            None => Err(TaskError::Failed(
                "no files to send: no invoking output and no path configured".into(),
            )),
        }
    }
}

impl Task for FileSender {
    fn run(&self, action: Option<&str>, ctx: &RunContext) -> Result<Outcome, TaskError> {
        if let Some(other) = action {
            return Err(TaskError::UnknownAction {
                action: other.to_string(),
            });
        }

        let files = self.files_to_send(ctx)?;
        for path in &files {
            info!("Queueing file transfer for {}", path.display());
            self.connection
                .send_file(path)
                .map_err(|e| TaskError::Failed(e.to_string()))?;
        }
        Ok(Outcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::RecordingConnection;
    use crate::tasks::TaskShared;

    fn ctx(invoking: Option<Arc<TaskShared>>) -> RunContext {
        RunContext {
            shared: Arc::new(TaskShared::new("shipper")),
            invoking,
        }
    }

    #[test]
    fn test_ships_invoking_output() {
        let conn = Arc::new(RecordingConnection::new());
        let sender = FileSender::new(&BTreeMap::new(), conn.clone()).unwrap();

        let invoking = Arc::new(TaskShared::new("gps"));
        invoking.set_output(vec![
            PathBuf::from("/data/gps/a.dat"),
            PathBuf::from("/data/gps/b.dat"),
        ]);

        let outcome = sender.run(None, &ctx(Some(invoking))).unwrap();
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(conn.files.lock().len(), 2);
    }

    #[test]
    fn test_ships_configured_path() {
        let conn = Arc::new(RecordingConnection::new());
        let mut args = BTreeMap::new();
        args.insert("path".to_string(), "/data/track.dat".to_string());
        let sender = FileSender::new(&args, conn.clone()).unwrap();

        sender.run(None, &ctx(None)).unwrap();
        assert_eq!(conn.files.lock()[0], PathBuf::from("/data/track.dat"));
    }

    #[test]
    fn test_nothing_to_send_fails() {
        let conn = Arc::new(RecordingConnection::new());
        let sender = FileSender::new(&BTreeMap::new(), conn).unwrap();
        assert!(sender.run(None, &ctx(None)).is_err());
    }
}
