//! Wakeup time synchronisation against the Iridium network clock.
//!
//! The RTC on the board drifts badly between site visits; after waking, the
//! system clock is compared to the satellite network time and reset when
//! the delta exceeds the threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::modem::{Connection, ModemError};
use crate::tasks::{check_keys, sleep::rtc_clock, Outcome, RunContext, Task, TaskError};

const DEFAULT_THRESHOLD_SECS: i64 = 10;

pub struct WakeupTimeSync {
    threshold_secs: i64,
    connection: Arc<dyn Connection>,
}

impl WakeupTimeSync {
    pub fn new(
        args: &BTreeMap<String, String>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, String> {
        check_keys(args, &["threshold"])?;
        let threshold_secs = match args.get("threshold") {
            Some(value) => value
                .parse()
                .map_err(|_| format!("threshold is not a number of seconds: \"{value}\""))?,
            None => DEFAULT_THRESHOLD_SECS,
        };
        Ok(Self {
            threshold_secs,
            connection,
        })
    }
}

impl Task for WakeupTimeSync {
    fn run(&self, action: Option<&str>, ctx: &RunContext) -> Result<Outcome, TaskError> {
        if let Some(other) = action {
            return Err(TaskError::UnknownAction {
                action: other.to_string(),
            });
        }

        let network_time = match self.connection.get_system_time() {
            Ok(time) => time,
            Err(ModemError::LockUnavailable(reason)) => {
                warn!("Cannot sync time, modem unavailable: {reason}");
                return Ok(Outcome::Warning);
            }
            Err(e) => {
                warn!("Cannot get Iridium time: {e}");
                return Ok(Outcome::Critical);
            }
        };

        let delta = (network_time - Utc::now()).num_seconds();
        info!("Iridium time {network_time}, system clock delta {delta}s");
        ctx.shared
            .set_message(&format!("clock delta {delta}s against Iridium time"));

        if delta.abs() <= self.threshold_secs {
            return Ok(Outcome::Ok);
        }

        if set_system_clock(network_time) {
            rtc_clock(true);
            Ok(Outcome::Ok)
        } else {
            Ok(Outcome::Critical)
        }
    }
}

/// Step the system clock to the given UTC time via `date -u -s`.
fn set_system_clock(to: DateTime<Utc>) -> bool {
    let stamp = to.format("%Y-%m-%d %H:%M:%S").to_string();
    info!("Setting system clock to {stamp} UTC");
    match std::process::Command::new("date")
        .args(["-u", "-s", &stamp])
        .status()
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("date exited with {status}, clock not set");
            false
        }
        Err(e) => {
            warn!("could not run date: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::RecordingConnection;
    use crate::tasks::TaskShared;

    fn ctx() -> RunContext {
        RunContext {
            shared: Arc::new(TaskShared::new("timesync")),
            invoking: None,
        }
    }

    #[test]
    fn test_within_threshold_is_ok() {
        let conn = Arc::new(RecordingConnection::new());
        *conn.system_time.lock() = Some(Utc::now());
        let task = WakeupTimeSync::new(&BTreeMap::new(), conn).unwrap();
        assert_eq!(task.run(None, &ctx()).unwrap(), Outcome::Ok);
    }

    #[test]
    fn test_modem_failure_is_critical() {
        let conn = Arc::new(RecordingConnection::new());
        let task = WakeupTimeSync::new(&BTreeMap::new(), conn).unwrap();
        assert_eq!(task.run(None, &ctx()).unwrap(), Outcome::Critical);
    }

    #[test]
    fn test_threshold_parse() {
        let mut args = BTreeMap::new();
        args.insert("threshold".to_string(), "300".to_string());
        let conn = Arc::new(RecordingConnection::new());
        let task = WakeupTimeSync::new(&args, conn).unwrap();
        assert_eq!(task.threshold_secs, 300);

        let mut bad = BTreeMap::new();
        bad.insert("threshold".to_string(), "soon".to_string());
        let conn = Arc::new(RecordingConnection::new());
        assert!(WakeupTimeSync::new(&bad, conn).is_err());
    }
}
