//! Configuration loading and defaults.
//!
//! Configuration is a single TOML file passed via `--config <path>`. The file
//! mirrors the struct hierarchy:
//!
//! ```toml
//! [general]
//! start_when_fail = false
//! pid_file = "/tmp/fieldnode.pid"
//! mt_destination = "/data/fieldnode/messages"
//!
//! [logging]
//! level = "info"
//! directory = "/data/fieldnode/logs"
//!
//! [modem]
//! serial_port = "/dev/ttyUSB0"
//! serial_baud = 115200
//! modem_power_dio = "1_20"
//! offline_start = "0000"   # optional HHMM (UTC)
//! offline_end = "0230"
//! dialup_number = "00881600005452"
//!
//! [[actions]]
//! id = "battery"
//! task = "command"
//! interval = 60
//! on_critical = "sbd"
//! [actions.args]
//! path = "/opt/site/check_batt.sh"
//! [actions.on_critical_args]
//! message = "battery check failed"
//! ```
//!
//! Each action carries exactly one trigger: `onboot`, `interval` (minutes),
//! `interval_secs`, `date` + `time` (one-shot), or any subset of the cron
//! fields (`year`, `month`, `day`, `week`, `day_of_week`, `hour`, `minute`,
//! `second`, `start_date`, `end_date`). `onboot` may be combined with a
//! recurring trigger. Validation runs before startup; every error is
//! reported and the process exits non-zero.

use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::Deserialize;

/// Errors reading or parsing the configuration file. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Modem settings; the legacy `[ModemConnection]` section name is
    /// accepted as an alias.
    #[serde(default, alias = "ModemConnection")]
    pub modem: ModemConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Continue startup even when an `on_start` check fails (default false).
    #[serde(default)]
    pub start_when_fail: bool,
    /// PID file path, exclusively locked while running.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Directory where received MT messages are written.
    #[serde(default = "default_mt_destination")]
    pub mt_destination: String,
}

/// Modem and serial line settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// Modem variant: `rudics` (default) or the stub `certus`.
    #[serde(rename = "type", default = "default_modem_type")]
    pub modem_type: String,
    /// Serial device path (default `/dev/ttyUSB0`).
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    /// Serial baud rate (default 115 200).
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    /// Serial read/write timeout in seconds (default 5).
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout: f64,
    /// Sleep between modem worker iterations in seconds (default 5).
    #[serde(default = "default_modem_wait")]
    pub modem_wait: f64,
    /// DIO pin powering the modem (e.g. `1_20`). Omit to skip power switching.
    pub modem_power_dio: Option<String>,
    /// Seconds to wait after powering the modem before the first byte (default 3).
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
    /// Start of the modem offline window, `HHMM` UTC. Window is disabled
    /// unless both ends are set.
    pub offline_start: Option<String>,
    /// End of the modem offline window, `HHMM` UTC.
    pub offline_end: Option<String>,
    /// Network registration attempts before giving up (default 6).
    #[serde(default = "default_max_reg_checks")]
    pub max_reg_checks: u32,
    /// Seconds between registration attempts (default 10).
    #[serde(default = "default_reg_check_interval")]
    pub reg_check_interval: f64,
    /// Default AT response timeout in seconds (default 20).
    #[serde(default = "default_msg_timeout")]
    pub msg_timeout: f64,
    /// Seconds to idle between empty serial reads (default 1).
    #[serde(default = "default_msg_wait_period")]
    pub msg_wait_period: f64,
    /// Extended timeout for SBDIX exchanges in seconds (default 60).
    #[serde(default = "default_sbd_xfer_timeout")]
    pub sbd_xfer_timeout: f64,
    /// SBDIX attempts before an MO failure is persistent (default 3).
    #[serde(default = "default_sbd_attempts")]
    pub sbd_attempts: u32,
    /// Seconds between SBDIX attempts (default 1).
    #[serde(default = "default_sbd_gap")]
    pub sbd_gap: u64,
    /// Talking to a virtualised pty (socat test harness) rather than real
    /// hardware: switches the line terminator to LF.
    #[serde(rename = "virtual", default)]
    pub virtual_modem: bool,
    /// Cut-down RockBLOCK 9603 variant: LF terminator, no registration
    /// checks, 340-byte SBD payload limit.
    #[serde(default)]
    pub rockblock: bool,
    /// RUDICS dial-up number. File transfers are dropped when unset.
    pub dialup_number: Option<String>,
    /// Seconds to wait for CONNECT after dialling (default 120).
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,
    /// Iridium era epoch for AT-MSSTM arithmetic. Rolls over every ~12 years.
    #[serde(default = "default_iridium_epoch")]
    pub iridium_epoch: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for dated log files. Omit to log to stdout only.
    pub directory: Option<String>,
}

/// One scheduled action from `[[actions]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    /// Unique action id, also the scheduler job id.
    pub id: String,
    /// Task kind name, resolved against the task registry at startup.
    pub task: String,
    /// Opaque task arguments, validated by the task constructor.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Sub-operation to invoke (e.g. `check` on a supervisor task); the
    /// task's default action when unset.
    pub action: Option<String>,

    /// Run once on the first planning pass after boot.
    #[serde(default)]
    pub onboot: bool,
    /// Recurring interval in minutes.
    pub interval: Option<u32>,
    /// Recurring interval in seconds.
    pub interval_secs: Option<u32>,
    /// One-shot date, `YYYYMMDD`.
    pub date: Option<String>,
    /// One-shot time, `HHMM` (defaults to 1200 when only `date` is given).
    pub time: Option<String>,

    // Cron-style fields. Each accepts `*`, a value, or a comma list.
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub week: Option<String>,
    pub day_of_week: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub second: Option<String>,
    /// First date (inclusive, `YYYYMMDD`) a cron job may fire.
    pub start_date: Option<String>,
    /// Last date (inclusive, `YYYYMMDD`) a cron job may fire.
    pub end_date: Option<String>,

    /// Run during the pre-planning initial checks; a result worse than OK
    /// aborts startup unless `general.start_when_fail` is set.
    #[serde(default)]
    pub on_start: bool,

    /// Follow-on task kinds, instantiated when this action returns the
    /// matching outcome.
    pub on_ok: Option<String>,
    pub on_warning: Option<String>,
    pub on_critical: Option<String>,
    pub on_invalid: Option<String>,
    #[serde(default)]
    pub on_ok_args: BTreeMap<String, String>,
    #[serde(default)]
    pub on_warning_args: BTreeMap<String, String>,
    #[serde(default)]
    pub on_critical_args: BTreeMap<String, String>,
    #[serde(default)]
    pub on_invalid_args: BTreeMap<String, String>,
}

fn default_pid_file() -> String {
    "/tmp/fieldnode.pid".to_string()
}
fn default_mt_destination() -> String {
    "/data/fieldnode/messages".to_string()
}
fn default_modem_type() -> String {
    "rudics".to_string()
}
fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_serial_baud() -> u32 {
    115_200
}
fn default_serial_timeout() -> f64 {
    5.0
}
fn default_modem_wait() -> f64 {
    5.0
}
fn default_grace_period() -> u64 {
    3
}
fn default_max_reg_checks() -> u32 {
    6
}
fn default_reg_check_interval() -> f64 {
    10.0
}
fn default_msg_timeout() -> f64 {
    20.0
}
fn default_msg_wait_period() -> f64 {
    1.0
}
fn default_sbd_xfer_timeout() -> f64 {
    60.0
}
fn default_sbd_attempts() -> u32 {
    3
}
fn default_sbd_gap() -> u64 {
    1
}
fn default_call_timeout() -> u64 {
    120
}
fn default_iridium_epoch() -> String {
    "2014-05-11 14:23:55".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            start_when_fail: false,
            pid_file: default_pid_file(),
            mt_destination: default_mt_destination(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            modem_type: default_modem_type(),
            serial_port: default_serial_port(),
            serial_baud: default_serial_baud(),
            serial_timeout: default_serial_timeout(),
            modem_wait: default_modem_wait(),
            modem_power_dio: None,
            grace_period: default_grace_period(),
            offline_start: None,
            offline_end: None,
            max_reg_checks: default_max_reg_checks(),
            reg_check_interval: default_reg_check_interval(),
            msg_timeout: default_msg_timeout(),
            msg_wait_period: default_msg_wait_period(),
            sbd_xfer_timeout: default_sbd_xfer_timeout(),
            sbd_attempts: default_sbd_attempts(),
            sbd_gap: default_sbd_gap(),
            virtual_modem: false,
            rockblock: false,
            dialup_number: None,
            call_timeout: default_call_timeout(),
            iridium_epoch: default_iridium_epoch(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl ModemConfig {
    /// Line terminator: CR for real hardware, LF for the virtual pty harness
    /// and the RockBLOCK variant.
    #[must_use]
    pub fn line_end(&self) -> &'static str {
        if self.virtual_modem || self.rockblock {
            "\n"
        } else {
            "\r"
        }
    }

    /// Maximum SBD MO payload: 340 bytes on the 9603 (RockBLOCK), 1920 on
    /// the full 9522B transceiver.
    #[must_use]
    pub fn payload_limit(&self) -> usize {
        if self.rockblock {
            340
        } else {
            1920
        }
    }
}

/// Parse an `HHMM` clock string as used by the offline window and one-shot
/// triggers.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    if s.len() != 4 {
        return None;
    }
    NaiveTime::parse_from_str(s, "%H%M").ok()
}

impl ActionConfig {
    /// Whether any cron-style field is present.
    #[must_use]
    pub fn has_cron_fields(&self) -> bool {
        self.year.is_some()
            || self.month.is_some()
            || self.day.is_some()
            || self.week.is_some()
            || self.day_of_week.is_some()
            || self.hour.is_some()
            || self.minute.is_some()
            || self.second.is_some()
    }

    /// Raw follow-on binding for an outcome: `(task kind, args)`. The
    /// scheduler routes only non-`INVALID` outcomes; the `on_invalid`
    /// binding is accepted and validated but never fired.
    #[must_use]
    pub fn follow_on(
        &self,
        outcome: crate::tasks::Outcome,
    ) -> Option<(&str, &BTreeMap<String, String>)> {
        use crate::tasks::Outcome;
        match outcome {
            Outcome::Ok => self.on_ok.as_deref().map(|t| (t, &self.on_ok_args)),
            Outcome::Warning => self
                .on_warning
                .as_deref()
                .map(|t| (t, &self.on_warning_args)),
            Outcome::Critical => self
                .on_critical
                .as_deref()
                .map(|t| (t, &self.on_critical_args)),
            Outcome::Invalid => self
                .on_invalid
                .as_deref()
                .map(|t| (t, &self.on_invalid_args)),
        }
    }
}

impl Config {
    /// Load and parse the configuration file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Validate the configuration, returning every problem found. Startup
    /// proceeds only when the list is empty.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.modem.modem_type != "rudics" && self.modem.modem_type != "certus" {
            errors.push(format!(
                "modem.type must be \"rudics\" or \"certus\", got \"{}\"",
                self.modem.modem_type
            ));
        }

        match (&self.modem.offline_start, &self.modem.offline_end) {
            (Some(start), Some(end)) => {
                if parse_hhmm(start).is_none() {
                    errors.push(format!("modem.offline_start is not HHMM: \"{start}\""));
                }
                if parse_hhmm(end).is_none() {
                    errors.push(format!("modem.offline_end is not HHMM: \"{end}\""));
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                errors.push(
                    "modem.offline_start and modem.offline_end must both be set to enable the offline window"
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if let Some(num) = &self.modem.dialup_number {
            if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
                errors.push(format!("modem.dialup_number must be digits: \"{num}\""));
            }
        }

        if chrono::NaiveDateTime::parse_from_str(&self.modem.iridium_epoch, "%Y-%m-%d %H:%M:%S")
            .is_err()
        {
            errors.push(format!(
                "modem.iridium_epoch is not \"YYYY-MM-DD HH:MM:SS\": \"{}\"",
                self.modem.iridium_epoch
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for action in &self.actions {
            if !seen.insert(action.id.as_str()) {
                errors.push(format!("duplicate action id \"{}\"", action.id));
            }
            if !crate::tasks::is_known_kind(&action.task) {
                errors.push(format!(
                    "action \"{}\": unknown task kind \"{}\"",
                    action.id, action.task
                ));
            }
            for binding in [
                &action.on_ok,
                &action.on_warning,
                &action.on_critical,
                &action.on_invalid,
            ]
            .into_iter()
            .flatten()
            {
                if !crate::tasks::is_known_kind(binding) {
                    errors.push(format!(
                        "action \"{}\": unknown follow-on task kind \"{}\"",
                        action.id, binding
                    ));
                }
            }

            let recurring = [
                action.interval.is_some(),
                action.interval_secs.is_some(),
                action.date.is_some() || action.time.is_some(),
                action.has_cron_fields(),
            ]
            .iter()
            .filter(|present| **present)
            .count();
            if recurring > 1 {
                errors.push(format!(
                    "action \"{}\": more than one trigger configured",
                    action.id
                ));
            }
            if recurring == 0 && !action.onboot && !action.on_start {
                errors.push(format!("action \"{}\": no trigger configured", action.id));
            }
            if let Some(date) = &action.date {
                if chrono::NaiveDate::parse_from_str(date, "%Y%m%d").is_err() {
                    errors.push(format!(
                        "action \"{}\": date is not YYYYMMDD: \"{date}\"",
                        action.id
                    ));
                }
            }
            if let Some(time) = &action.time {
                if parse_hhmm(time).is_none() {
                    errors.push(format!(
                        "action \"{}\": time is not HHMM: \"{time}\"",
                        action.id
                    ));
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(actions: &str) -> Config {
        let text = format!(
            r#"
[modem]
serial_port = "/dev/ttyUSB0"
{actions}
"#
        );
        toml::from_str(&text).expect("parse")
    }

    #[test]
    fn test_defaults() {
        let cfg = minimal("");
        assert_eq!(cfg.modem.serial_baud, 115_200);
        assert_eq!(cfg.modem.modem_type, "rudics");
        assert_eq!(cfg.modem.payload_limit(), 1920);
        assert_eq!(cfg.modem.line_end(), "\r");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_rockblock_limits() {
        let text = r#"
[modem]
rockblock = true
"#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.modem.payload_limit(), 340);
        assert_eq!(cfg.modem.line_end(), "\n");
    }

    #[test]
    fn test_action_round_trip() {
        let cfg = minimal(
            r#"
[[actions]]
id = "battery"
task = "command"
interval = 60
on_critical = "sbd"
[actions.args]
path = "/opt/site/check_batt.sh"
[actions.on_critical_args]
message = "battery check failed"
"#,
        );
        assert!(cfg.validate().is_empty());
        let action = &cfg.actions[0];
        assert_eq!(action.interval, Some(60));
        assert_eq!(action.args.get("path").unwrap(), "/opt/site/check_batt.sh");
        let (task, args) = action.follow_on(crate::tasks::Outcome::Critical).unwrap();
        assert_eq!(task, "sbd");
        assert_eq!(args.get("message").unwrap(), "battery check failed");
        assert!(action.follow_on(crate::tasks::Outcome::Ok).is_none());
    }

    #[test]
    fn test_conflicting_triggers_rejected() {
        let cfg = minimal(
            r#"
[[actions]]
id = "x"
task = "command"
interval = 5
hour = "12"
"#,
        );
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn test_missing_trigger_rejected() {
        let cfg = minimal(
            r#"
[[actions]]
id = "x"
task = "command"
"#,
        );
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn test_unknown_task_kind_rejected() {
        let cfg = minimal(
            r#"
[[actions]]
id = "x"
task = "nonsense"
onboot = true
"#,
        );
        assert!(cfg.validate().iter().any(|e| e.contains("unknown task")));
    }

    #[test]
    fn test_half_open_offline_window_rejected() {
        let text = r#"
[modem]
offline_start = "0100"
"#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn test_modem_connection_section_alias() {
        let text = r#"
[ModemConnection]
serial_baud = 19200
"#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.modem.serial_baud, 19_200);
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(
            parse_hhmm("2301"),
            Some(NaiveTime::from_hms_opt(23, 1, 0).unwrap())
        );
        assert!(parse_hhmm("9999").is_none());
        assert!(parse_hhmm("12:00").is_none());
    }
}
