//! Task kinds and the registry that builds them from configuration.
//!
//! Every task is a named instance constructed once at startup from its
//! action's arguments. The scheduler invokes it with an optional action
//! name (`start`, `stop`, `check`, ...) and the task reports back one of
//! the four outcomes, which drives the `on_ok`/`on_warning`/`on_critical`/
//! `on_invalid` follow-on bindings. Any fault escaping a task body is
//! converted to `Invalid` at the boundary — tasks never take the scheduler
//! down.

pub mod command;
pub mod file;
pub mod rudics;
pub mod sbd;
pub mod sleep;
pub mod ssh;
pub mod timesync;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::modem::Connection;

/// Result of one task invocation, routed to follow-on bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Warning,
    Critical,
    Invalid,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Warning => "WARNING",
            Outcome::Critical => "CRITICAL",
            Outcome::Invalid => "INVALID",
        }
    }

    /// Severity rank used by the startup checks: anything above `Ok` blocks
    /// startup unless `start_when_fail` is set.
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Outcome::Ok => 0,
            Outcome::Warning => 1,
            Outcome::Critical => 2,
            Outcome::Invalid => 3,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("there is no {action} action for this task")]
    UnknownAction { action: String },
    #[error("{0}")]
    Failed(String),
}

/// State a task exposes to its follow-ons. A follow-on receives the
/// producing task's shared record as `invoking` and can read its last
/// outcome, free-form message, and output files.
pub struct TaskShared {
    pub id: String,
    state: Mutex<String>,
    message: Mutex<Option<String>>,
    output: Mutex<Vec<PathBuf>>,
}

impl TaskShared {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(String::new()),
            message: Mutex::new(None),
            output: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock() = state.to_string();
    }

    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    pub fn set_message(&self, message: &str) {
        *self.message.lock() = Some(message.to_string());
    }

    #[must_use]
    pub fn output(&self) -> Vec<PathBuf> {
        self.output.lock().clone()
    }

    pub fn set_output(&self, files: Vec<PathBuf>) {
        *self.output.lock() = files;
    }
}

/// Context for one invocation.
pub struct RunContext {
    /// This task's own shared record.
    pub shared: Arc<TaskShared>,
    /// The shared record of the task whose outcome triggered this one
    /// (follow-on invocations only).
    pub invoking: Option<Arc<TaskShared>>,
}

/// A schedulable task instance.
pub trait Task: Send + Sync {
    /// Run the named action (or the task's default when `None`).
    fn run(&self, action: Option<&str>, ctx: &RunContext) -> Result<Outcome, TaskError>;

    /// Release background resources (supervisor threads) at shutdown.
    fn stop(&self) {}
}

/// A constructed task with its shared state.
pub struct RegisteredTask {
    pub kind: String,
    pub task: Arc<dyn Task>,
    pub shared: Arc<TaskShared>,
}

const TASK_KINDS: &[&str] = &[
    "sbd",
    "file",
    "rudics",
    "sshtunnel",
    "sleep",
    "command",
    "timesync",
];

/// Whether the configuration names a task kind this build knows about.
#[must_use]
pub fn is_known_kind(kind: &str) -> bool {
    TASK_KINDS.contains(&kind)
}

/// Build a task instance from its configured kind and arguments.
/// Unknown kinds and unrecognised argument keys fail fast at startup.
pub fn build(
    kind: &str,
    id: &str,
    args: &BTreeMap<String, String>,
    connection: &Arc<dyn Connection>,
) -> Result<RegisteredTask, String> {
    let task: Arc<dyn Task> = match kind {
        "sbd" => Arc::new(sbd::SbdSender::new(args, Arc::clone(connection))?),
        "file" => Arc::new(file::FileSender::new(args, Arc::clone(connection))?),
        "rudics" => Arc::new(rudics::RudicsDialer::new(args, Arc::clone(connection))?),
        "sshtunnel" => Arc::new(ssh::SshTunnel::new(args)?),
        "sleep" => Arc::new(sleep::Sleep::new(args)?),
        "command" => Arc::new(command::Command::new(args)?),
        "timesync" => Arc::new(timesync::WakeupTimeSync::new(args, Arc::clone(connection))?),
        other => return Err(format!("no task kind named \"{other}\"")),
    };

    Ok(RegisteredTask {
        kind: kind.to_string(),
        task,
        shared: Arc::new(TaskShared::new(id)),
    })
}

/// Reject argument keys the task does not declare.
pub(crate) fn check_keys(
    args: &BTreeMap<String, String>,
    allowed: &[&str],
) -> Result<(), String> {
    for key in args.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(format!("unrecognised argument \"{key}\""));
        }
    }
    Ok(())
}

/// Parse an optional boolean argument (`true`/`false`/`1`/`0`).
pub(crate) fn parse_bool_arg(
    args: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    match args.get(key).map(String::as_str) {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(format!("argument \"{key}\" is not a boolean: \"{other}\"")),
    }
}

/// The task boundary: run an invocation, convert faults (errors and panics)
/// into `Invalid`, and record the outcome on the shared state.
pub fn run_boundary(
    registered: &RegisteredTask,
    action: Option<&str>,
    invoking: Option<Arc<TaskShared>>,
) -> Outcome {
    let ctx = RunContext {
        shared: Arc::clone(&registered.shared),
        invoking,
    };
    debug!(
        "Calling action {} on task {}",
        action.unwrap_or("default"),
        registered.shared.id
    );

    let outcome =
        match std::panic::catch_unwind(AssertUnwindSafe(|| registered.task.run(action, &ctx))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("Task {} failed: {e}", registered.shared.id);
                Outcome::Invalid
            }
            Err(_) => {
                error!("Unhandled panic within task {}", registered.shared.id);
                Outcome::Invalid
            }
        };

    registered.shared.set_state(outcome.as_str());
    outcome
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;
    impl Task for Panicking {
        fn run(&self, _action: Option<&str>, _ctx: &RunContext) -> Result<Outcome, TaskError> {
            panic!("boom")
        }
    }

    struct Failing;
    impl Task for Failing {
        fn run(&self, _action: Option<&str>, _ctx: &RunContext) -> Result<Outcome, TaskError> {
            Err(TaskError::Failed("nope".to_string()))
        }
    }

    fn registered(task: Arc<dyn Task>) -> RegisteredTask {
        RegisteredTask {
            kind: "test".to_string(),
            task,
            shared: Arc::new(TaskShared::new("t1")),
        }
    }

    #[test]
    fn test_known_kinds() {
        assert!(is_known_kind("sbd"));
        assert!(is_known_kind("sleep"));
        assert!(!is_known_kind("SBD"));
        assert!(!is_known_kind("nonsense"));
    }

    #[test]
    fn test_boundary_converts_panic_to_invalid() {
        let reg = registered(Arc::new(Panicking));
        assert_eq!(run_boundary(&reg, None, None), Outcome::Invalid);
        assert_eq!(reg.shared.state(), "INVALID");
    }

    #[test]
    fn test_boundary_converts_error_to_invalid() {
        let reg = registered(Arc::new(Failing));
        assert_eq!(run_boundary(&reg, None, None), Outcome::Invalid);
    }

    #[test]
    fn test_outcome_severity_ordering() {
        assert!(Outcome::Ok.severity() < Outcome::Warning.severity());
        assert!(Outcome::Warning.severity() < Outcome::Critical.severity());
        assert!(Outcome::Critical.severity() < Outcome::Invalid.severity());
    }

    #[test]
    fn test_check_keys() {
        let mut args = BTreeMap::new();
        args.insert("message".to_string(), "hi".to_string());
        assert!(check_keys(&args, &["message"]).is_ok());
        assert!(check_keys(&args, &["other"]).is_err());
    }

    #[test]
    fn test_parse_bool_arg() {
        let mut args = BTreeMap::new();
        args.insert("flag".to_string(), "true".to_string());
        assert_eq!(parse_bool_arg(&args, "flag", false).unwrap(), true);
        assert_eq!(parse_bool_arg(&args, "missing", true).unwrap(), true);
        args.insert("bad".to_string(), "maybe".to_string());
        assert!(parse_bool_arg(&args, "bad", false).is_err());
    }
}
