//! Cron-style trigger matching.
//!
//! Supports the field set `year`, `month`, `day`, `week`, `day_of_week`,
//! `hour`, `minute`, `second` plus inclusive `start_date`/`end_date`
//! bounds. Each field accepts `*`, a single value, or a comma list.
//! Fields more significant than the most precise one specified default to
//! `*`; less significant fields default to their minimum, so `hour = "12"`
//! means 12:00:00 daily, not every second of that hour. `day_of_week` is
//! 0 = Monday through 6 = Sunday; `week` is the ISO week number.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec == "*" {
            return Ok(CronField::Any);
        }
        let mut values = Vec::new();
        for part in spec.split(',') {
            let value = part
                .trim()
                .parse()
                .map_err(|_| format!("bad cron field value \"{part}\""))?;
            values.push(value);
        }
        values.sort_unstable();
        values.dedup();
        if values.is_empty() {
            return Err(format!("empty cron field \"{spec}\""));
        }
        Ok(CronField::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }

    /// Candidate values within `[min, max]`, smallest first.
    fn candidates(&self, min: u32, max: u32) -> Vec<u32> {
        match self {
            CronField::Any => (min..=max).collect(),
            CronField::Values(values) => values
                .iter()
                .copied()
                .filter(|v| (min..=max).contains(v))
                .collect(),
        }
    }
}

/// Raw field strings as they appear on an action.
#[derive(Debug, Default, Clone)]
pub struct CronParts {
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub week: Option<String>,
    pub day_of_week: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub second: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    year: CronField,
    month: CronField,
    day: CronField,
    week: CronField,
    day_of_week: CronField,
    hour: CronField,
    minute: CronField,
    second: CronField,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

/// How far `next_after` searches before giving up; a year-constrained cron
/// may genuinely have no firing for a long time.
const SEARCH_DAYS: i64 = 400;

impl CronSchedule {
    pub fn parse(parts: &CronParts) -> Result<Self, String> {
        // Significance chain: fields below the most precise specified one
        // default to their minimum, fields above default to *.
        let chain = [
            parts.year.as_deref(),
            parts.month.as_deref(),
            parts.day.as_deref(),
            parts.hour.as_deref(),
            parts.minute.as_deref(),
            parts.second.as_deref(),
        ];
        let day_filters = parts.week.is_some() || parts.day_of_week.is_some();
        let mut deepest = chain.iter().rposition(Option::is_some);
        if day_filters {
            deepest = Some(deepest.map_or(2, |d| d.max(2)));
        }
        let Some(deepest) = deepest else {
            return Err("no cron fields specified".to_string());
        };

        let mins = ["*", "1", "1", "0", "0", "0"];
        let mut fields = Vec::with_capacity(chain.len());
        for (pos, spec) in chain.iter().enumerate() {
            let field = match spec {
                Some(spec) => CronField::parse(spec)?,
                None if pos <= deepest => CronField::Any,
                None => CronField::parse(mins[pos])?,
            };
            fields.push(field);
        }
        let [year, month, day, hour, minute, second] =
            <[CronField; 6]>::try_from(fields).expect("six chain fields");

        let parse_date = |spec: &Option<String>, name: &str| -> Result<Option<NaiveDate>, String> {
            spec.as_deref()
                .map(|s| {
                    NaiveDate::parse_from_str(s, "%Y%m%d")
                        .map_err(|_| format!("{name} is not YYYYMMDD: \"{s}\""))
                })
                .transpose()
        };

        Ok(Self {
            year,
            month,
            day,
            week: parts
                .week
                .as_deref()
                .map_or(Ok(CronField::Any), CronField::parse)?,
            day_of_week: parts
                .day_of_week
                .as_deref()
                .map_or(Ok(CronField::Any), CronField::parse)?,
            hour,
            minute,
            second,
            start_date: parse_date(&parts.start_date, "start_date")?,
            end_date: parse_date(&parts.end_date, "end_date")?,
        })
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }
        #[allow(clippy::cast_sign_loss)]
        let year = date.year() as u32;
        self.year.matches(year)
            && self.month.matches(date.month())
            && self.day.matches(date.day())
            && self.week.matches(date.iso_week().week())
            && self.day_of_week.matches(date.weekday().num_days_from_monday())
    }

    /// The first firing strictly after `after`, if any within the search
    /// window.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_date = after.date_naive();

        for day_offset in 0..=SEARCH_DAYS {
            let date = after_date + chrono::Duration::days(day_offset);
            if !self.date_matches(date) {
                continue;
            }
            let same_day = day_offset == 0;

            for hour in self.hour.candidates(0, 23) {
                if same_day && hour < after.hour() {
                    continue;
                }
                for minute in self.minute.candidates(0, 59) {
                    for second in self.second.candidates(0, 59) {
                        let candidate = Utc
                            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, second)
                            .single()?;
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(build: impl FnOnce(&mut CronParts)) -> CronParts {
        let mut parts = CronParts::default();
        build(&mut parts);
        parts
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_hour_only_defaults_lower_fields_to_zero() {
        let cron = CronSchedule::parse(&parts(|p| p.hour = Some("12".into()))).unwrap();
        let next = cron.next_after(at(2021, 6, 1, 8, 30, 0)).unwrap();
        assert_eq!(next, at(2021, 6, 1, 12, 0, 0));
    }

    #[test]
    fn test_rolls_over_to_next_day() {
        let cron = CronSchedule::parse(&parts(|p| p.hour = Some("12".into()))).unwrap();
        let next = cron.next_after(at(2021, 6, 1, 13, 0, 0)).unwrap();
        assert_eq!(next, at(2021, 6, 2, 12, 0, 0));
    }

    #[test]
    fn test_strictly_after() {
        let cron = CronSchedule::parse(&parts(|p| p.hour = Some("12".into()))).unwrap();
        let next = cron.next_after(at(2021, 6, 1, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2021, 6, 2, 12, 0, 0));
    }

    #[test]
    fn test_minute_only_fires_hourly() {
        let cron = CronSchedule::parse(&parts(|p| p.minute = Some("30".into()))).unwrap();
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 8, 45, 0)).unwrap(),
            at(2021, 6, 1, 9, 30, 0)
        );
    }

    #[test]
    fn test_comma_list() {
        let cron = CronSchedule::parse(&parts(|p| {
            p.hour = Some("6,18".into());
        }))
        .unwrap();
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 7, 0, 0)).unwrap(),
            at(2021, 6, 1, 18, 0, 0)
        );
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 19, 0, 0)).unwrap(),
            at(2021, 6, 2, 6, 0, 0)
        );
    }

    #[test]
    fn test_day_of_week_filter() {
        // 2021-06-01 is a Tuesday; 0 = Monday.
        let cron = CronSchedule::parse(&parts(|p| {
            p.day_of_week = Some("0".into());
            p.hour = Some("9".into());
        }))
        .unwrap();
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 0, 0, 0)).unwrap(),
            at(2021, 6, 7, 9, 0, 0)
        );
    }

    #[test]
    fn test_date_bounds() {
        let cron = CronSchedule::parse(&parts(|p| {
            p.hour = Some("12".into());
            p.start_date = Some("20210610".into());
            p.end_date = Some("20210611".into());
        }))
        .unwrap();
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 0, 0, 0)).unwrap(),
            at(2021, 6, 10, 12, 0, 0)
        );
        assert!(cron.next_after(at(2021, 6, 11, 13, 0, 0)).is_none());
    }

    #[test]
    fn test_explicit_seconds() {
        let cron = CronSchedule::parse(&parts(|p| {
            p.minute = Some("0".into());
            p.second = Some("15,45".into());
        }))
        .unwrap();
        assert_eq!(
            cron.next_after(at(2021, 6, 1, 8, 0, 15)).unwrap(),
            at(2021, 6, 1, 8, 0, 45)
        );
    }

    #[test]
    fn test_no_fields_rejected() {
        assert!(CronSchedule::parse(&CronParts::default()).is_err());
    }

    #[test]
    fn test_bad_value_rejected() {
        assert!(CronSchedule::parse(&parts(|p| p.hour = Some("noon".into()))).is_err());
    }
}
