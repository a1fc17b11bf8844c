//! Generic external command task.
//!
//! Runs a site-specific binary with `--key value` arguments and derives the
//! outcome from a Nagios-style keyword in its stdout, e.g.
//! `critical - battery at 10.9V`. Lines naming existing absolute paths are
//! collected as output files for a follow-on file sender.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::tasks::{Outcome, RunContext, Task, TaskError};

/// Argument keys consumed by the task itself; every other key is forwarded
/// to the binary as `--key value`.
const RESERVED_KEYS: &[&str] = &["path", "name"];

pub struct Command {
    name: String,
    path: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(args: &BTreeMap<String, String>) -> Result<Self, String> {
        let path = args
            .get("path")
            .cloned()
            .ok_or_else(|| "command task requires a \"path\" argument".to_string())?;
        let name = args.get("name").cloned().unwrap_or_else(|| path.clone());

        let mut forwarded = Vec::new();
        for (key, value) in args {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            forwarded.push(format!("--{key}"));
            forwarded.push(value.clone());
        }
        debug!("Command {name}: {path} {forwarded:?}");

        Ok(Self {
            name,
            path,
            args: forwarded,
        })
    }
}

impl Task for Command {
    fn run(&self, action: Option<&str>, ctx: &RunContext) -> Result<Outcome, TaskError> {
        if let Some(other) = action {
            return Err(TaskError::UnknownAction {
                action: other.to_string(),
            });
        }

        info!("Checking command {}", self.name);
        let output = std::process::Command::new(&self.path)
            .args(&self.args)
            .output()
            .map_err(|e| TaskError::Failed(format!("failed to run {}: {e}", self.path)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Got exit status {} from {}: {}",
                output.status,
                self.name,
                stderr.trim()
            );
            return Err(TaskError::Failed(format!(
                "{} exited with {}",
                self.name, output.status
            )));
        }

        debug!("Check return output: {:?}", stdout.trim());
        ctx.shared.set_message(stdout.trim());
        ctx.shared.set_output(collect_output_files(&stdout));

        parse_check_output(&stdout).ok_or_else(|| {
            TaskError::Failed(format!(
                "an unparseable status was received from {}: {:?}",
                self.name,
                stdout.trim()
            ))
        })
    }
}

/// Find the Nagios-style status keyword: `ok|warning|critical|invalid`
/// followed by a dash, case-insensitive, anywhere in the output. The last
/// occurrence wins.
fn parse_check_output(output: &str) -> Option<Outcome> {
    const KEYWORDS: &[(&str, Outcome)] = &[
        ("warning", Outcome::Warning),
        ("critical", Outcome::Critical),
        ("invalid", Outcome::Invalid),
        ("ok", Outcome::Ok),
    ];

    let lowered = output.to_ascii_lowercase();
    let mut latest: Option<(usize, Outcome)> = None;

    for (keyword, outcome) in KEYWORDS {
        let mut search_from = 0;
        while let Some(found) = lowered[search_from..].find(keyword) {
            let pos = search_from + found;
            let rest = &lowered[pos + keyword.len()..];
            if rest.trim_start().starts_with('-')
                && latest.map_or(true, |(best, _)| pos > best)
            {
                latest = Some((pos, *outcome));
            }
            search_from = pos + keyword.len();
        }
    }

    latest.map(|(_, outcome)| outcome)
}

/// Absolute paths in the output that name existing files — the produced
/// artefacts a follow-on file sender should ship.
fn collect_output_files(output: &str) -> Vec<PathBuf> {
    output
        .split_whitespace()
        .filter(|token| token.starts_with('/'))
        .map(PathBuf::from)
        .filter(|path| path.is_file())
        .collect()
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
