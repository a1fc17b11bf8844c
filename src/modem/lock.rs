//! Exclusive hardware gate for the single physical modem.
//!
//! The lock owns the modem power DIO line and the configured offline window.
//! Acquisition powers the modem on (`tshwctl --setdio <pin>`) and waits the
//! grace period for it to boot; the returned guard powers it off again on
//! drop, on every exit path including panics. Nothing may write to the
//! serial line without holding a [`ModemGuard`].

use std::time::Duration;

use chrono::{NaiveTime, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{parse_hhmm, ModemConfig};
use crate::modem::ModemError;

/// Settle time after lowering the DIO line.
const POWER_OFF_SETTLE: Duration = Duration::from_secs(2);

/// Reentrant mutual exclusion over the modem, plus power-line control and
/// the offline window.
pub struct ModemLock {
    inner: ReentrantMutex<()>,
    power_dio: Option<String>,
    grace_period: Duration,
    offline_start: Option<NaiveTime>,
    offline_end: Option<NaiveTime>,
}

/// Held while the modem is powered and owned by the current thread.
///
/// Guards are not `Send`: acquire and release must happen on the same
/// thread (the worker or supervisor thread that took the lock).
pub struct ModemGuard<'a> {
    power_dio: Option<&'a str>,
    _inner: ReentrantMutexGuard<'a, ()>,
}

impl Drop for ModemGuard<'_> {
    fn drop(&mut self) {
        if let Some(pin) = self.power_dio {
            info!("Releasing and switching off modem {pin}");
            if let Err(e) = dio_command("--clrdio", pin) {
                warn!("Failed to lower modem DIO {pin}: {e}");
            }
            std::thread::sleep(POWER_OFF_SETTLE);
        }
    }
}

impl ModemLock {
    #[must_use]
    pub fn new(cfg: &ModemConfig) -> Self {
        Self {
            inner: ReentrantMutex::new(()),
            power_dio: cfg.modem_power_dio.clone(),
            grace_period: Duration::from_secs(cfg.grace_period),
            offline_start: cfg.offline_start.as_deref().and_then(parse_hhmm),
            offline_end: cfg.offline_end.as_deref().and_then(parse_hhmm),
        }
    }

    /// Take the lock and power the modem on.
    ///
    /// Fails without touching the hardware when the current UTC time falls
    /// inside the offline window, when `blocking` is false and another
    /// thread holds the lock, or when the DIO raise command fails (the
    /// mutex is released again in that case).
    pub fn acquire(&self, blocking: bool) -> Result<ModemGuard<'_>, ModemError> {
        if in_offline_window(self.offline_start, self.offline_end, Utc::now().time()) {
            info!("Barring use of the modem during pre-determined window");
            return Err(ModemError::LockUnavailable("offline window".to_string()));
        }

        let inner = if blocking {
            self.inner.lock()
        } else {
            self.inner
                .try_lock()
                .ok_or_else(|| ModemError::LockUnavailable("modem in use".to_string()))?
        };

        if let Some(pin) = &self.power_dio {
            info!("Acquiring and switching on modem {pin}");
            if let Err(e) = dio_command("--setdio", pin) {
                warn!("Non-zero acquisition command return value, releasing the lock");
                drop(inner);
                return Err(ModemError::LockUnavailable(format!(
                    "DIO raise failed: {e}"
                )));
            }
            debug!(
                "Sleeping for grace period of {}s to allow modem boot",
                self.grace_period.as_secs()
            );
            std::thread::sleep(self.grace_period);
        }

        Ok(ModemGuard {
            power_dio: self.power_dio.as_deref(),
            _inner: inner,
        })
    }
}

/// Run `tshwctl <flag> <pin>`, mapping a non-zero exit to an error.
fn dio_command(flag: &str, pin: &str) -> Result<(), String> {
    let status = std::process::Command::new("tshwctl")
        .arg(flag)
        .arg(pin)
        .status()
        .map_err(|e| format!("tshwctl: {e}"))?;
    debug!("tshwctl returned: {status}");
    if status.success() {
        Ok(())
    } else {
        Err(format!("tshwctl exited with {status}"))
    }
}

/// Whether `now` lies inside `[start, end]` on today's date. The window is
/// disabled when either end is unconfigured; it does not wrap midnight.
fn in_offline_window(
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    now: NaiveTime,
) -> bool {
    match (start, end) {
        (Some(start), Some(end)) => start <= now && now <= end,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hhmm(s: &str) -> Option<NaiveTime> {
        parse_hhmm(s)
    }

    fn unpowered_lock() -> ModemLock {
        ModemLock::new(&ModemConfig {
            modem_power_dio: None,
            grace_period: 0,
            ..ModemConfig::default()
        })
    }

    #[test]
    fn test_offline_window_inside() {
        assert!(in_offline_window(
            hhmm("0000"),
            hhmm("2359"),
            NaiveTime::from_hms_opt(12, 30, 0).unwrap()
        ));
    }

    #[test]
    fn test_offline_window_outside() {
        assert!(!in_offline_window(
            hhmm("0100"),
            hhmm("0230"),
            NaiveTime::from_hms_opt(3, 0, 0).unwrap()
        ));
    }

    #[test]
    fn test_offline_window_boundaries_inclusive() {
        assert!(in_offline_window(
            hhmm("0100"),
            hhmm("0230"),
            NaiveTime::from_hms_opt(1, 0, 0).unwrap()
        ));
        assert!(in_offline_window(
            hhmm("0100"),
            hhmm("0230"),
            NaiveTime::from_hms_opt(2, 30, 0).unwrap()
        ));
    }

    #[test]
    fn test_offline_window_disabled_when_unset() {
        assert!(!in_offline_window(
            None,
            hhmm("2359"),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap()
        ));
        assert!(!in_offline_window(None, None, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_acquire_is_reentrant_on_one_thread() {
        let lock = unpowered_lock();
        let first = lock.acquire(false).unwrap();
        let second = lock.acquire(false).unwrap();
        drop(second);
        drop(first);
    }

    #[test]
    fn test_nonblocking_acquire_fails_across_threads() {
        let lock = Arc::new(unpowered_lock());
        let guard = lock.acquire(false).unwrap();

        let contender = Arc::clone(&lock);
        let refused = std::thread::spawn(move || contender.acquire(false).is_err())
            .join()
            .unwrap();
        assert!(refused);
        drop(guard);

        let contender = Arc::clone(&lock);
        let acquired = std::thread::spawn(move || contender.acquire(false).is_ok())
            .join()
            .unwrap();
        assert!(acquired);
    }

    #[test]
    fn test_acquire_refused_in_offline_window() {
        let lock = ModemLock::new(&ModemConfig {
            modem_power_dio: None,
            grace_period: 0,
            offline_start: Some("0000".to_string()),
            offline_end: Some("2359".to_string()),
            ..ModemConfig::default()
        });
        assert!(matches!(
            lock.acquire(true),
            Err(ModemError::LockUnavailable(_))
        ));
    }
}
