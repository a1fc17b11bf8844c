//! Board sleep task for the TS-7400 style SBC.
//!
//! Computes the seconds until the configured wake time, syncs the RTC from
//! the OS clock, and hands off to the platform sleep command. Breadcrumb
//! files under `$HOME` record the intended sleep and the subsequent boot so
//! the next cycle can correct for boot-to-wake drift.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use tracing::{debug, info, warn};

use crate::tasks::{check_keys, Outcome, RunContext, Task, TaskError};

/// `<seconds>,<ISO8601 set-time>` — written just before sleeping.
pub const SLEEPINFO_FILE: &str = "sleepinfo.txt";
/// `Rebooted at <ctime>` — written at process startup.
pub const REBOOT_FILE: &str = "reboot.txt";

const CTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Never schedule a wake closer than this; the board needs time to settle.
const MIN_SLEEP_SECS: i64 = 60;

pub struct Sleep {
    until_date: String,
    until_time: String,
}

impl Sleep {
    pub fn new(args: &BTreeMap<String, String>) -> Result<Self, String> {
        check_keys(args, &["until_date", "until_time"])?;
        let task = Self {
            until_date: args
                .get("until_date")
                .cloned()
                .unwrap_or_else(|| "today".to_string()),
            until_time: args
                .get("until_time")
                .cloned()
                .unwrap_or_else(|| "1200".to_string()),
        };
        // Fail fast on an unparseable target rather than at 3am on site.
        compute_wake(&task.until_date, &task.until_time, Utc::now())
            .map_err(|e| format!("sleep target invalid: {e}"))?;
        Ok(task)
    }
}

impl Task for Sleep {
    fn run(&self, action: Option<&str>, _ctx: &RunContext) -> Result<Outcome, TaskError> {
        if let Some(other) = action {
            return Err(TaskError::UnknownAction {
                action: other.to_string(),
            });
        }

        let now = Utc::now();
        let wake = compute_wake(&self.until_date, &self.until_time, now)
            .map_err(TaskError::Failed)?;
        let mut seconds = (wake - now).num_seconds();

        let home = home_dir();
        if let Some(drift) = boot_drift(&home) {
            info!("Adjusting sleep by {drift}s of boot-to-wake drift");
            seconds -= drift;
        }
        seconds = seconds.max(MIN_SLEEP_SECS);

        rtc_clock(true);

        if let Err(e) = write_sleepinfo(&home, seconds, now) {
            warn!("Could not record sleep info: {e}");
        }

        info!("Sleeping for {seconds} seconds (wake at {wake})");
        let status = std::process::Command::new("tshwctl")
            .args(["-L", "-m", &seconds.to_string()])
            .status();

        match status {
            Ok(status) if status.success() => Ok(Outcome::Ok),
            Ok(status) => {
                warn!("Did not manage to go to sleep, something's very wrong: {status}");
                Ok(Outcome::Critical)
            }
            Err(e) => {
                warn!("Did not manage to go to sleep, something's very wrong: {e}");
                Ok(Outcome::Critical)
            }
        }
    }
}

/// Set (or read back) the RTC from the OS clock via the platform utility.
pub fn rtc_clock(set: bool) {
    let flag = if set { "--setrtc" } else { "--getrtc" };
    info!("{}etting RTC from OS clock", if set { "S" } else { "G" });
    match std::process::Command::new("tshwctl").arg(flag).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("Did not manage to adjust RTC: {status}"),
        Err(e) => warn!("Did not manage to adjust RTC: {e}"),
    }
}

/// Record the boot time for the next sleep cycle's drift correction.
pub fn write_reboot_breadcrumb() {
    let home = home_dir();
    let line = format!("Rebooted at {}", Utc::now().format(CTIME_FORMAT));
    if let Err(e) = std::fs::write(home.join(REBOOT_FILE), line) {
        debug!("Could not write reboot breadcrumb: {e}");
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/root"), PathBuf::from)
}

/// Resolve the wake target: `today`, `tomorrow`, or an explicit `DDMMYYYY`
/// date, combined with an `HHMM` time.
fn compute_wake(
    until_date: &str,
    until_time: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, String> {
    let date = match until_date.to_ascii_lowercase().as_str() {
        "today" => now.date_naive(),
        "tomorrow" => now.date_naive() + ChronoDuration::days(1),
        explicit => NaiveDate::parse_from_str(explicit, "%d%m%Y")
            .map_err(|_| format!("until_date not today/tomorrow/DDMMYYYY: \"{until_date}\""))?,
    };
    let time = NaiveTime::parse_from_str(until_time, "%H%M")
        .map_err(|_| format!("until_time not HHMM: \"{until_time}\""))?;
    Ok(date.and_time(time).and_utc())
}

/// Drift of the last boot against the wake it was scheduled for, from the
/// breadcrumb pair. Positive means the board woke late.
fn boot_drift(home: &Path) -> Option<i64> {
    let sleepinfo = std::fs::read_to_string(home.join(SLEEPINFO_FILE)).ok()?;
    let reboot = std::fs::read_to_string(home.join(REBOOT_FILE)).ok()?;

    let (seconds, set_at) = parse_sleepinfo(&sleepinfo)?;
    let rebooted = parse_reboot_line(&reboot)?;

    let intended_wake = set_at + ChronoDuration::seconds(seconds);
    let drift = (rebooted - intended_wake).num_seconds();
    debug!("Intended wake {intended_wake}, rebooted {rebooted}, drift {drift}s");

    // A stale breadcrumb from a long-gone cycle is no basis for correction.
    if drift.abs() > 3600 {
        warn!("Ignoring implausible boot drift of {drift}s");
        return None;
    }
    Some(drift)
}

fn parse_sleepinfo(content: &str) -> Option<(i64, DateTime<Utc>)> {
    let (seconds, set_at) = content.trim().split_once(',')?;
    let seconds = seconds.trim().parse().ok()?;
    let set_at = DateTime::parse_from_rfc3339(set_at.trim())
        .ok()?
        .with_timezone(&Utc);
    Some((seconds, set_at))
}

fn parse_reboot_line(content: &str) -> Option<DateTime<Utc>> {
    let stamp = content.trim().strip_prefix("Rebooted at ")?;
    chrono::NaiveDateTime::parse_from_str(stamp.trim(), CTIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

fn write_sleepinfo(home: &Path, seconds: i64, now: DateTime<Utc>) -> std::io::Result<()> {
    std::fs::write(
        home.join(SLEEPINFO_FILE),
        format!("{seconds},{}", now.to_rfc3339()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_wake_today() {
        let now = at(2021, 6, 1, 8, 0);
        let wake = compute_wake("today", "1200", now).unwrap();
        assert_eq!(wake, at(2021, 6, 1, 12, 0));
    }

    #[test]
    fn test_wake_tomorrow() {
        let now = at(2021, 6, 1, 8, 0);
        let wake = compute_wake("tomorrow", "0630", now).unwrap();
        assert_eq!(wake, at(2021, 6, 2, 6, 30));
    }

    #[test]
    fn test_wake_explicit_date() {
        let now = at(2021, 6, 1, 8, 0);
        let wake = compute_wake("15072021", "0900", now).unwrap();
        assert_eq!(wake, at(2021, 7, 15, 9, 0));
    }

    #[test]
    fn test_wake_bad_forms_rejected() {
        let now = at(2021, 6, 1, 8, 0);
        assert!(compute_wake("yesterday", "1200", now).is_err());
        assert!(compute_wake("2021-07-15", "1200", now).is_err());
        assert!(compute_wake("today", "noon", now).is_err());
    }

    #[test]
    fn test_sleepinfo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let now = at(2021, 6, 1, 20, 0);
        write_sleepinfo(dir.path(), 36_000, now).unwrap();

        let content = std::fs::read_to_string(dir.path().join(SLEEPINFO_FILE)).unwrap();
        let (seconds, set_at) = parse_sleepinfo(&content).unwrap();
        assert_eq!(seconds, 36_000);
        assert_eq!(set_at, now);
    }

    #[test]
    fn test_reboot_line_round_trip() {
        let when = at(2021, 6, 2, 6, 1);
        let line = format!("Rebooted at {}", when.format(CTIME_FORMAT));
        assert_eq!(parse_reboot_line(&line), Some(when));
        assert!(parse_reboot_line("garbage").is_none());
    }

    #[test]
    fn test_boot_drift_positive_when_late() {
        let dir = tempfile::tempdir().unwrap();
        let set_at = at(2021, 6, 1, 20, 0);
        // Intended wake 06:00, actual boot 06:02 → 120s late.
        write_sleepinfo(dir.path(), 36_000, set_at).unwrap();
        let rebooted = at(2021, 6, 2, 6, 2);
        std::fs::write(
            dir.path().join(REBOOT_FILE),
            format!("Rebooted at {}", rebooted.format(CTIME_FORMAT)),
        )
        .unwrap();

        assert_eq!(boot_drift(dir.path()), Some(120));
    }

    #[test]
    fn test_boot_drift_ignores_stale_breadcrumbs() {
        let dir = tempfile::tempdir().unwrap();
        let set_at = at(2021, 6, 1, 20, 0);
        write_sleepinfo(dir.path(), 36_000, set_at).unwrap();
        let rebooted = at(2021, 6, 5, 12, 0);
        std::fs::write(
            dir.path().join(REBOOT_FILE),
            format!("Rebooted at {}", rebooted.format(CTIME_FORMAT)),
        )
        .unwrap();

        assert_eq!(boot_drift(dir.path()), None);
    }

    #[test]
    fn test_boot_drift_none_without_breadcrumbs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(boot_drift(dir.path()), None);
    }

    #[test]
    fn test_constructor_validates_target() {
        let mut args = BTreeMap::new();
        args.insert("until_date".to_string(), "not-a-date".to_string());
        assert!(Sleep::new(&args).is_err());
    }
}
