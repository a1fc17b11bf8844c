//! RUDICS dial-up supervisor task.
//!
//! `start` takes the modem lock, launches the PPP dialer (`wvdial` or
//! `pppd`), and hands both to a supervisor thread that watches the network
//! interface for the lifetime of the call. The lock is held by that thread
//! from dial to teardown — nothing else may touch the radio while a data
//! call is up. Teardown walks the signal ladder (SIGTERM repeatedly, then
//! SIGKILL) and clears any stale PPP pid file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::modem::lock::ModemLock;
use crate::modem::Connection;
use crate::tasks::{check_keys, Outcome, RunContext, Task, TaskError};

const POLL_STEP: Duration = Duration::from_millis(250);

/// Supervisor's view of the PPP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Starting,
    Up,
    Down,
    Failed,
    Stopped,
}

#[derive(Clone)]
struct DialerParams {
    device: String,
    dialer: String,
    max_checks: u32,
    check_interval: Duration,
    max_kill_tries: u32,
    wait_to_stop: Duration,
    pid_file: PathBuf,
}

struct Supervisor {
    running: Arc<AtomicBool>,
    status: Arc<Mutex<LinkStatus>>,
    thread: Option<thread::JoinHandle<()>>,
}

pub struct RudicsDialer {
    params: DialerParams,
    connection: Arc<dyn Connection>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl RudicsDialer {
    pub fn new(
        args: &BTreeMap<String, String>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, String> {
        check_keys(
            args,
            &[
                "device",
                "dialer",
                "max_checks",
                "check_interval",
                "max_kill_tries",
                "wait_to_stop",
                "pid_file",
            ],
        )?;

        let device = args
            .get("device")
            .cloned()
            .unwrap_or_else(|| "ppp0".to_string());
        let params = DialerParams {
            dialer: args
                .get("dialer")
                .cloned()
                .unwrap_or_else(|| "wvdial".to_string()),
            max_checks: parse_u32(args, "max_checks", 12)?,
            check_interval: Duration::from_secs_f64(parse_f64(args, "check_interval", 10.0)?),
            max_kill_tries: parse_u32(args, "max_kill_tries", 3)?,
            wait_to_stop: Duration::from_secs_f64(parse_f64(args, "wait_to_stop", 5.0)?),
            pid_file: args
                .get("pid_file")
                .map_or_else(|| PathBuf::from(format!("/var/run/{device}.pid")), PathBuf::from),
            device,
        };

        Ok(Self {
            params,
            connection,
            supervisor: Mutex::new(None),
        })
    }

    fn current_status(&self) -> Option<LinkStatus> {
        self.supervisor
            .lock()
            .as_ref()
            .map(|sup| *sup.status.lock())
    }

    fn start(&self) -> Result<Outcome, TaskError> {
        if let Some(status) = self.current_status() {
            match status {
                LinkStatus::Starting | LinkStatus::Up | LinkStatus::Down => {
                    info!("Dialer supervisor already active ({status:?})");
                    return Ok(status_outcome(status));
                }
                LinkStatus::Failed | LinkStatus::Stopped => self.stop_supervisor(),
            }
        }

        let lock = self.connection.modem_lock().ok_or_else(|| {
            TaskError::Failed("this modem variant has no radio to dial with".into())
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(LinkStatus::Starting));
        let params = self.params.clone();
        let thread_running = Arc::clone(&running);
        let thread_status = Arc::clone(&status);

        let handle = thread::Builder::new()
            .name(format!("rudics-{}", self.params.device))
            .spawn(move || supervise(&params, &lock, &thread_running, &thread_status))
            .map_err(|e| TaskError::Failed(format!("spawn supervisor thread: {e}")))?;

        *self.supervisor.lock() = Some(Supervisor {
            running,
            status: Arc::clone(&status),
            thread: Some(handle),
        });

        // Wait for the bring-up to conclude one way or the other.
        let budget = self.params.check_interval * self.params.max_checks
            + Duration::from_secs(30);
        let deadline = Instant::now() + budget;
        loop {
            let current = *status.lock();
            if current != LinkStatus::Starting {
                return Ok(status_outcome(current));
            }
            if Instant::now() >= deadline {
                warn!("Dialer still starting after {budget:?}");
                return Ok(Outcome::Warning);
            }
            thread::sleep(POLL_STEP);
        }
    }

    fn check(&self) -> Outcome {
        match self.current_status() {
            Some(status) => status_outcome(status),
            None => {
                debug!("Dialer supervisor is not running");
                Outcome::Warning
            }
        }
    }

    fn stop_supervisor(&self) {
        let sup = self.supervisor.lock().take();
        if let Some(mut sup) = sup {
            info!("Stopping dialer supervisor for {}", self.params.device);
            sup.running.store(false, Ordering::Relaxed);
            if let Some(handle) = sup.thread.take() {
                if handle.join().is_err() {
                    warn!("Dialer supervisor thread panicked");
                }
            }
        }
    }
}

impl Task for RudicsDialer {
    fn run(&self, action: Option<&str>, _ctx: &RunContext) -> Result<Outcome, TaskError> {
        match action {
            None | Some("start") => self.start(),
            Some("check") => Ok(self.check()),
            Some("stop") => {
                self.stop_supervisor();
                Ok(Outcome::Ok)
            }
            Some(other) => Err(TaskError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }

    fn stop(&self) {
        self.stop_supervisor();
    }
}

fn status_outcome(status: LinkStatus) -> Outcome {
    match status {
        LinkStatus::Up => Outcome::Ok,
        LinkStatus::Starting | LinkStatus::Down => Outcome::Warning,
        LinkStatus::Failed | LinkStatus::Stopped => Outcome::Critical,
    }
}

/// Supervisor thread body. Owns the modem lock for the whole call.
fn supervise(
    params: &DialerParams,
    lock: &ModemLock,
    running: &AtomicBool,
    status: &Mutex<LinkStatus>,
) {
    let guard = match lock.acquire(true) {
        Ok(guard) => guard,
        Err(e) => {
            error!("Cannot take the modem for a data call: {e}");
            *status.lock() = LinkStatus::Failed;
            return;
        }
    };

    debug!("Starting {} and hoping it has a \"square go\" at things", params.dialer);
    let mut child = match std::process::Command::new(&params.dialer).spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to start {}: {e}", params.dialer);
            *status.lock() = LinkStatus::Failed;
            drop(guard);
            return;
        }
    };

    // Bring-up: wait for the interface to appear with an address.
    let mut rechecks = 0;
    while running.load(Ordering::Relaxed)
        && !interface_ready(&params.device)
        && rechecks < params.max_checks
    {
        debug!(
            "We have yet to get an interface up on check {} of {}",
            rechecks + 1,
            params.max_checks
        );
        sleep_while_running(params.check_interval, running);
        rechecks += 1;
    }

    if !interface_ready(&params.device) {
        if running.load(Ordering::Relaxed) {
            error!("We have failed to bring up the {} interface", params.device);
            *status.lock() = LinkStatus::Failed;
        } else {
            *status.lock() = LinkStatus::Stopped;
        }
        teardown(params, &mut child);
        return;
    }

    info!("We have the {} interface up", params.device);
    *status.lock() = LinkStatus::Up;

    // Monitor until stopped or the link dies for good.
    let mut misses = 0;
    while running.load(Ordering::Relaxed) {
        sleep_while_running(params.check_interval, running);
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if interface_ready(&params.device) {
            misses = 0;
            *status.lock() = LinkStatus::Up;
        } else {
            misses += 1;
            warn!(
                "Interface {} missing on check {} of {}",
                params.device, misses, params.max_checks
            );
            *status.lock() = LinkStatus::Down;
            if misses >= params.max_checks {
                error!("Interface {} is gone, ending the call", params.device);
                *status.lock() = LinkStatus::Failed;
                break;
            }
        }
    }

    teardown(params, &mut child);
    {
        let mut current = status.lock();
        if *current != LinkStatus::Failed {
            *current = LinkStatus::Stopped;
        }
    }
    drop(guard);
}

/// Kill the dialer and its helpers, then clear any stale pid file.
fn teardown(params: &DialerParams, child: &mut std::process::Child) {
    info!("Terminating dialer process with PID {}", child.id());
    #[allow(clippy::cast_possible_wrap)]
    let child_pid = Pid::from_raw(child.id() as i32);
    let _ = signal::kill(child_pid, Signal::SIGTERM);
    thread::sleep(params.wait_to_stop);

    if !terminate_ladder(params) {
        warn!("{} processes survived the termination ladder", params.dialer);
    }
    let _ = child.wait();

    if params.pid_file.exists() {
        info!("Removing stale pid file {}", params.pid_file.display());
        if let Err(e) = std::fs::remove_file(&params.pid_file) {
            warn!("Could not remove {}: {e}", params.pid_file.display());
        }
    }
}

/// SIGTERM up to `max_kill_tries - 1` times, then SIGKILL.
fn terminate_ladder(params: &DialerParams) -> bool {
    let mut pids = dialer_pids(&params.dialer);
    if pids.is_empty() {
        return true;
    }

    let mut retries = 0;
    while !pids.is_empty() && retries < params.max_kill_tries {
        let sig = if retries == params.max_kill_tries - 1 {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        for pid in &pids {
            debug!("PID {pid} being given {sig}");
            let _ = signal::kill(Pid::from_raw(*pid), sig);
        }
        thread::sleep(params.wait_to_stop);
        retries += 1;
        debug!("Attempt {retries} to stop {}", params.dialer);
        pids = dialer_pids(&params.dialer);
    }
    pids.is_empty()
}

/// PIDs of running dialer processes, from `ps -e`.
fn dialer_pids(name: &str) -> Vec<i32> {
    match std::process::Command::new("ps").arg("-e").output() {
        Ok(output) => parse_ps_e(&String::from_utf8_lossy(&output.stdout), name),
        Err(e) => {
            warn!("Could not run ps: {e}");
            Vec::new()
        }
    }
}

/// Parse `ps -e` output: four columns, command last.
fn parse_ps_e(output: &str, name: &str) -> Vec<i32> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 || !fields[3].starts_with(name) {
                return None;
            }
            fields[0].parse().ok()
        })
        .collect()
}

/// The interface exists in procfs and `ip addr show` reports an inet
/// address on it.
fn interface_ready(device: &str) -> bool {
    let conf = Path::new("/proc/sys/net/ipv4/conf").join(device);
    if !conf.exists() {
        return false;
    }
    match std::process::Command::new("ip")
        .args(["addr", "show", device])
        .output()
    {
        Ok(output) => has_inet_line(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            warn!("Could not run ip addr show: {e}");
            false
        }
    }
}

fn has_inet_line(output: &str) -> bool {
    output.lines().any(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with("inet ") && trimmed.split_whitespace().nth(1).is_some()
    })
}

fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let mut waited = Duration::ZERO;
    while waited < total && running.load(Ordering::Relaxed) {
        let step = POLL_STEP.min(total - waited);
        thread::sleep(step);
        waited += step;
    }
}

fn parse_u32(args: &BTreeMap<String, String>, key: &str, default: u32) -> Result<u32, String> {
    match args.get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| format!("argument \"{key}\" is not an integer: \"{value}\"")),
        None => Ok(default),
    }
}

fn parse_f64(args: &BTreeMap<String, String>, key: &str, default: f64) -> Result<f64, String> {
    match args.get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| format!("argument \"{key}\" is not a number: \"{value}\"")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_E: &str = "\
  PID TTY          TIME CMD
    1 ?        00:00:03 init
  214 ?        00:00:00 wvdial
  215 ?        00:00:00 pppd
  330 pts/0    00:00:00 ps
";

    #[test]
    fn test_parse_ps_e_finds_dialer() {
        assert_eq!(parse_ps_e(PS_E, "wvdial"), vec![214]);
        assert_eq!(parse_ps_e(PS_E, "pppd"), vec![215]);
    }

    #[test]
    fn test_parse_ps_e_ignores_header_and_others() {
        assert!(parse_ps_e(PS_E, "autossh").is_empty());
        assert!(parse_ps_e("", "wvdial").is_empty());
    }

    #[test]
    fn test_has_inet_line() {
        let output = "\
2: ppp0: <POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP> mtu 1500
    link/ppp
    inet 10.64.64.64 peer 10.112.112.112/32 scope global ppp0
";
        assert!(has_inet_line(output));
    }

    #[test]
    fn test_has_inet_line_without_address() {
        let output = "\
2: ppp0: <POINTOPOINT,MULTICAST,NOARP> mtu 1500
    link/ppp
";
        assert!(!has_inet_line(output));
        // inet6 alone does not count.
        assert!(!has_inet_line("    inet6 fe80::1/64 scope link\n"));
    }

    #[test]
    fn test_status_outcomes() {
        assert_eq!(status_outcome(LinkStatus::Up), Outcome::Ok);
        assert_eq!(status_outcome(LinkStatus::Down), Outcome::Warning);
        assert_eq!(status_outcome(LinkStatus::Failed), Outcome::Critical);
        assert_eq!(status_outcome(LinkStatus::Stopped), Outcome::Critical);
    }

    #[test]
    fn test_arg_parsing() {
        let mut args = BTreeMap::new();
        args.insert("max_checks".to_string(), "4".to_string());
        assert_eq!(parse_u32(&args, "max_checks", 12).unwrap(), 4);
        assert_eq!(parse_u32(&args, "missing", 12).unwrap(), 12);

        args.insert("check_interval".to_string(), "2.5".to_string());
        assert!((parse_f64(&args, "check_interval", 10.0).unwrap() - 2.5).abs() < f64::EPSILON);

        args.insert("bad".to_string(), "x".to_string());
        assert!(parse_u32(&args, "bad", 1).is_err());
    }
}
