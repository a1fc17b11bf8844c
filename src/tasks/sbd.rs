//! SBD message sender task.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::modem::{Connection, SbdMessage};
use crate::tasks::{check_keys, parse_bool_arg, Outcome, RunContext, Task, TaskError};

/// Enqueues a short SBD message. Invoked as a follow-on it reports the
/// invoking task's message or state; scheduled directly it sends the
/// configured `message` argument.
pub struct SbdSender {
    message: Option<String>,
    include_date: bool,
    warning: bool,
    critical: bool,
    connection: Arc<dyn Connection>,
}

impl SbdSender {
    pub fn new(
        args: &BTreeMap<String, String>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, String> {
        check_keys(args, &["message", "include_date", "warning", "critical"])?;
        Ok(Self {
            message: args.get("message").cloned(),
            include_date: parse_bool_arg(args, "include_date", true)?,
            warning: parse_bool_arg(args, "warning", false)?,
            critical: parse_bool_arg(args, "critical", false)?,
            connection,
        })
    }

    fn message_text(&self, ctx: &RunContext) -> Result<String, TaskError> {
        if let Some(invoking) = &ctx.invoking {
            let detail = invoking.message().unwrap_or_else(|| invoking.state());
            let body = self
                .message
                .as_deref()
                .map_or_else(|| detail.clone(), |m| format!("{m}: {detail}"));
            return Ok(format!("{}: {body}", invoking.id));
        }
        self.message
            .clone()
            .ok_or_else(|| TaskError::Failed("no message configured and no invoking task".into()))
    }

    fn send(&self, text: &str) -> Result<Outcome, TaskError> {
        let mut msg = if self.critical {
            SbdMessage::critical(text)
        } else {
            SbdMessage::text(text)
        };
        msg.warning = self.warning;
        if self.include_date {
            msg = msg.with_timestamp();
        }

        info!("Queueing SBD message of {} bytes", msg.payload.len());
        self.connection
            .send_message(msg)
            .map_err(|e| TaskError::Failed(e.to_string()))?;
        Ok(Outcome::Ok)
    }
}

impl Task for SbdSender {
    fn run(&self, action: Option<&str>, ctx: &RunContext) -> Result<Outcome, TaskError> {
        match action {
            None | Some("send_message") => {
                let text = self.message_text(ctx)?;
                ctx.shared.set_message(&text);
                self.send(&text)
            }
            Some(other) => Err(TaskError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::RecordingConnection;
    use crate::tasks::TaskShared;

    fn ctx(invoking: Option<Arc<TaskShared>>) -> RunContext {
        RunContext {
            shared: Arc::new(TaskShared::new("sender")),
            invoking,
        }
    }

    #[test]
    fn test_sends_configured_message() {
        let conn = Arc::new(RecordingConnection::new());
        let mut args = BTreeMap::new();
        args.insert("message".to_string(), "all well".to_string());
        args.insert("include_date".to_string(), "false".to_string());
        let sender = SbdSender::new(&args, conn.clone()).unwrap();

        let outcome = sender.run(None, &ctx(None)).unwrap();
        assert_eq!(outcome, Outcome::Ok);
        let queued = conn.messages.lock();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload, b"all well");
    }

    #[test]
    fn test_reports_invoking_task_state() {
        let conn = Arc::new(RecordingConnection::new());
        let sender = SbdSender::new(&BTreeMap::new(), conn.clone()).unwrap();

        let invoking = Arc::new(TaskShared::new("battery"));
        invoking.set_state("CRITICAL");
        invoking.set_message("critical - voltage 10.9V");

        let outcome = sender.run(None, &ctx(Some(invoking))).unwrap();
        assert_eq!(outcome, Outcome::Ok);
        let queued = conn.messages.lock();
        let text = String::from_utf8(queued[0].payload.clone()).unwrap();
        assert!(text.contains("battery"));
        assert!(text.contains("voltage 10.9V"));
    }

    #[test]
    fn test_no_message_and_no_invoker_fails() {
        let conn = Arc::new(RecordingConnection::new());
        let sender = SbdSender::new(&BTreeMap::new(), conn).unwrap();
        assert!(sender.run(None, &ctx(None)).is_err());
    }

    #[test]
    fn test_critical_flag_prefixes_body() {
        let conn = Arc::new(RecordingConnection::new());
        let mut args = BTreeMap::new();
        args.insert("message".to_string(), "link lost".to_string());
        args.insert("critical".to_string(), "true".to_string());
        args.insert("include_date".to_string(), "false".to_string());
        let sender = SbdSender::new(&args, conn.clone()).unwrap();

        sender.run(None, &ctx(None)).unwrap();
        let queued = conn.messages.lock();
        assert!(queued[0].payload.starts_with(b"critical -"));
        assert!(queued[0].critical);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let conn = Arc::new(RecordingConnection::new());
        let mut args = BTreeMap::new();
        args.insert("message".to_string(), "x".to_string());
        let sender = SbdSender::new(&args, conn).unwrap();
        assert!(matches!(
            sender.run(Some("explode"), &ctx(None)),
            Err(TaskError::UnknownAction { .. })
        ));
    }

    #[test]
    fn test_unknown_arg_rejected() {
        let conn = Arc::new(RecordingConnection::new());
        let mut args = BTreeMap::new();
        args.insert("mesage".to_string(), "typo".to_string());
        assert!(SbdSender::new(&args, conn).is_err());
    }
}
