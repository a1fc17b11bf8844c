//! AutoSSH reverse tunnel supervisor task.
//!
//! Starts `autossh` with a reverse port forward back to the home server and
//! verifies the tunnel by looking for a child `ssh` process of the autossh
//! pid in `ps -f` output. AutoSSH itself handles reconnection; this task
//! only brings it up, checks on it, and tears it down.

use std::collections::BTreeMap;
use std::process::Child;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::tasks::{check_keys, Outcome, RunContext, Task, TaskError};

pub struct SshTunnel {
    address: String,
    port: u16,
    user: String,
    max_checks: u32,
    check_interval: Duration,
    max_kill_tries: u32,
    wait_to_stop: Duration,
    child: Mutex<Option<Child>>,
}

impl SshTunnel {
    pub fn new(args: &BTreeMap<String, String>) -> Result<Self, String> {
        check_keys(
            args,
            &[
                "address",
                "port",
                "user",
                "max_checks",
                "check_interval",
                "max_kill_tries",
                "wait_to_stop",
            ],
        )?;

        let address = args
            .get("address")
            .cloned()
            .ok_or_else(|| "sshtunnel requires an \"address\" argument".to_string())?;
        let user = args
            .get("user")
            .cloned()
            .ok_or_else(|| "sshtunnel requires a \"user\" argument".to_string())?;
        let port = args
            .get("port")
            .ok_or_else(|| "sshtunnel requires a \"port\" argument".to_string())?
            .parse()
            .map_err(|_| "sshtunnel \"port\" is not a port number".to_string())?;

        let parse_u32 = |key: &str, default: u32| -> Result<u32, String> {
            match args.get(key) {
                Some(v) => v
                    .parse()
                    .map_err(|_| format!("argument \"{key}\" is not an integer: \"{v}\"")),
                None => Ok(default),
            }
        };
        let parse_secs = |key: &str, default: f64| -> Result<f64, String> {
            match args.get(key) {
                Some(v) => v
                    .parse()
                    .map_err(|_| format!("argument \"{key}\" is not a number: \"{v}\"")),
                None => Ok(default),
            }
        };

        Ok(Self {
            max_checks: parse_u32("max_checks", 12)?,
            check_interval: Duration::from_secs_f64(parse_secs("check_interval", 10.0)?),
            max_kill_tries: parse_u32("max_kill_tries", 3)?,
            wait_to_stop: Duration::from_secs_f64(parse_secs("wait_to_stop", 5.0)?),
            address,
            port,
            user,
            child: Mutex::new(None),
        })
    }

    fn start(&self) -> Result<Outcome, TaskError> {
        let mut child_slot = self.child.lock();
        if let Some(child) = child_slot.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    info!("AutoSSH already running (pid {})", child.id());
                    return Ok(if self.detect_tunnel(child.id()) {
                        Outcome::Ok
                    } else {
                        Outcome::Warning
                    });
                }
                _ => *child_slot = None,
            }
        }

        info!(
            "Opening AutoSSH tunnel to {}:{}",
            self.address, self.port
        );
        let child = std::process::Command::new("autossh")
            .args([
                "-M",
                "40000:40001",
                "-o",
                "GSSAPIAuthentication=no",
                "-o",
                "PasswordAuthentication=no",
                "-o",
                "ServerAliveInterval=10",
                "-o",
                "ServerAliveCountMax=5",
                "-R",
                &format!("{}:*:22", self.port),
                "-C",
                "-N",
                &format!("{}@{}", self.user, self.address),
            ])
            .spawn()
            .map_err(|e| TaskError::Failed(format!("failed to start autossh: {e}")))?;
        let pid = child.id();
        *child_slot = Some(child);
        drop(child_slot);

        debug!("Awaiting confirmation of an SSH process being alive");
        let mut rechecks = 1;
        while !self.detect_tunnel(pid) && rechecks <= self.max_checks {
            debug!(
                "We have yet to get tunnel up on check {} of {}",
                rechecks, self.max_checks
            );
            thread::sleep(self.check_interval);
            rechecks += 1;
        }

        if !self.detect_tunnel(pid) {
            warn!("We have failed to bring up the SSH tunnel");
            self.teardown();
            return Ok(Outcome::Critical);
        }

        info!("We have an active SSH tunnel (at least once anyway)");
        Ok(Outcome::Ok)
    }

    fn check(&self) -> Outcome {
        let child_slot = self.child.lock();
        match child_slot.as_ref() {
            Some(child) if self.detect_tunnel(child.id()) => Outcome::Ok,
            Some(_) => Outcome::Warning,
            None => {
                debug!("No SSH tunnel has been started");
                Outcome::Warning
            }
        }
    }

    fn detect_tunnel(&self, parent_pid: u32) -> bool {
        debug!("Determining if PID {parent_pid} has a child SSH tunnel");
        match std::process::Command::new("ps").arg("-f").output() {
            Ok(output) => {
                child_ssh_present(&String::from_utf8_lossy(&output.stdout), parent_pid)
            }
            Err(e) => {
                warn!("Could not run ps -f: {e}");
                false
            }
        }
    }

    fn teardown(&self) {
        let child = self.child.lock().take();
        let Some(mut child) = child else { return };

        info!(
            "Closing AutoSSH tunnel to {}:{}",
            self.address, self.port
        );
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);

        for attempt in 0..self.max_kill_tries {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            let sig = if attempt == self.max_kill_tries - 1 {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            };
            debug!("PID {pid} being given {sig}");
            let _ = signal::kill(pid, sig);
            thread::sleep(self.wait_to_stop);
        }
        let _ = child.wait();
    }
}

impl Task for SshTunnel {
    fn run(&self, action: Option<&str>, _ctx: &RunContext) -> Result<Outcome, TaskError> {
        match action {
            None | Some("start") => self.start(),
            Some("check") => Ok(self.check()),
            Some("stop") => {
                self.teardown();
                Ok(Outcome::Ok)
            }
            Some(other) => Err(TaskError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }

    fn stop(&self) {
        self.teardown();
    }
}

/// Whether `ps -f` shows an `ssh` child of the given autossh pid.
fn child_ssh_present(ps_output: &str, parent_pid: u32) -> bool {
    for line in ps_output.lines() {
        if line.starts_with("UID") || !line.contains("ssh") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Ok(_pid), Ok(ppid)) = (fields[1].parse::<u32>(), fields[2].parse::<u32>()) else {
            continue;
        };
        if ppid == parent_pid && is_ssh_command(&fields[7..].join(" ")) {
            return true;
        }
    }
    false
}

/// An ssh client invocation with a user@host target.
fn is_ssh_command(command: &str) -> bool {
    let command = command.strip_prefix("/usr/bin/").unwrap_or(command);
    command.starts_with("ssh ") && command.contains('@')
}
