// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Recurrence Calculator
//!
//! Declarative schedules for periodic persona wake-ups and the arithmetic
//! that turns "last ran at T" into "next run at T'".
//!
//! ## Grammar
//!
//! | Form | Meaning |
//! |------|---------|
//! | `EVERY:<N>h` / `EVERY:<N>m` | every N hours / minutes, phase-shifted per seed |
//! | `WEEKDAYS:MO:FR/10:30` | on the listed weekdays at local 10:30 |
//! | `MONTHDAY:15/09:00`, `MONTHDAY:-1/23:59` | on that day of month (`-1` = last day) |
//!
//! `EVERY` schedules are spread across the period by a deterministic phase
//! offset derived from a seed (usually the persona id), so many personas
//! sharing a period do not all fire at the same instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead weekday and month-day scans look before giving up.
/// Two full weeks plus a day, so a matching day lost to a DST gap still has
/// a successor inside the window.
const WEEKDAY_SCAN_DAYS: i64 = 15;
const MONTHDAY_SCAN_MONTHS: u32 = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Malformed schedule '{spec}': {reason}")]
    MalformedSpec { spec: String, reason: String },

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Day-of-month selector for [`ScheduleSpec::Monthday`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOfMonth {
    Day(u32),
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    Every { period_seconds: u64 },
    Weekdays { days: Vec<Weekday>, hour: u32, minute: u32 },
    Monthday { day: DayOfMonth, hour: u32, minute: u32 },
}

impl ScheduleSpec {
    /// Next fire time strictly after `last_run`, evaluated in the named IANA zone.
    pub fn next_run(
        &self,
        last_run: DateTime<Utc>,
        timezone: &str,
        jitter_seed: &str,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
        Ok(self.next_run_in(last_run, tz, jitter_seed))
    }

    /// Like [`ScheduleSpec::next_run`] with an already resolved zone.
    ///
    /// Returns `DateTime::<Utc>::MAX_UTC` when no candidate exists in the scan window.
    pub fn next_run_in(&self, last_run: DateTime<Utc>, tz: Tz, jitter_seed: &str) -> DateTime<Utc> {
        match self {
            ScheduleSpec::Every { period_seconds } => {
                next_every(last_run, *period_seconds, jitter_seed)
            }
            ScheduleSpec::Weekdays { days, hour, minute } => {
                next_weekday(last_run, tz, days, *hour, *minute)
            }
            ScheduleSpec::Monthday { day, hour, minute } => {
                next_monthday(last_run, tz, *day, *hour, *minute)
            }
        }
    }
}

/// 32-bit multiply-and-add rolling hash, base 131.
pub fn seed_hash(seed: &str) -> u32 {
    seed.bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u32))
}

/// Deterministic offset in `[0, period)` for `seed`.
pub fn phase_offset(seed: &str, period_seconds: u64) -> u64 {
    ((seed_hash(seed) as u128 * period_seconds as u128) >> 32) as u64
}

fn next_every(last_run: DateTime<Utc>, period_seconds: u64, seed: &str) -> DateTime<Utc> {
    if period_seconds == 0 {
        return DateTime::<Utc>::MAX_UTC;
    }
    let Ok(period) = i64::try_from(period_seconds) else {
        return DateTime::<Utc>::MAX_UTC;
    };
    let phase = phase_offset(seed, period_seconds) as i64;
    let last = last_run.timestamp();
    // Latest phase-aligned instant at or before `last`, then one period on.
    let aligned = last - (last - phase).rem_euclid(period);
    aligned
        .checked_add(period)
        .and_then(|next| DateTime::<Utc>::from_timestamp(next, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn local_candidate(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn next_weekday(
    last_run: DateTime<Utc>,
    tz: Tz,
    days: &[Weekday],
    hour: u32,
    minute: u32,
) -> DateTime<Utc> {
    let start = last_run.with_timezone(&tz).date_naive();
    for offset in 0..WEEKDAY_SCAN_DAYS {
        let date = start + Duration::days(offset);
        if !days.contains(&date.weekday()) {
            continue;
        }
        if let Some(candidate) = local_candidate(tz, date, hour, minute) {
            if candidate > last_run {
                return candidate;
            }
        }
    }
    DateTime::<Utc>::MAX_UTC
}

/// Last calendar day of the month containing the 28th of `year`/`month`.
fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let past_end = NaiveDate::from_ymd_opt(year, month, 28)? + Duration::days(4);
    Some(past_end - Duration::days(past_end.day() as i64))
}

fn next_monthday(
    last_run: DateTime<Utc>,
    tz: Tz,
    day: DayOfMonth,
    hour: u32,
    minute: u32,
) -> DateTime<Utc> {
    let local = last_run.with_timezone(&tz);
    let (mut year, mut month) = (local.year(), local.month());
    for _ in 0..MONTHDAY_SCAN_MONTHS {
        let date = match day {
            DayOfMonth::Last => last_day_of_month(year, month),
            DayOfMonth::Day(d) => NaiveDate::from_ymd_opt(year, month, d),
        };
        if let Some(candidate) = date.and_then(|d| local_candidate(tz, d, hour, minute)) {
            if candidate > last_run {
                return candidate;
            }
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    DateTime::<Utc>::MAX_UTC
}

fn malformed(spec: &str, reason: impl Into<String>) -> ScheduleError {
    ScheduleError::MalformedSpec {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

fn parse_time_of_day(spec: &str, hhmm: &str) -> Result<(u32, u32), ScheduleError> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| malformed(spec, "expected HH:MM"))?;
    if h.len() != 2 || m.len() != 2 {
        return Err(malformed(spec, "expected HH:MM"));
    }
    let hour: u32 = h.parse().map_err(|_| malformed(spec, "hour is not a number"))?;
    let minute: u32 = m.parse().map_err(|_| malformed(spec, "minute is not a number"))?;
    if hour > 23 || minute > 59 {
        return Err(malformed(spec, "time of day out of range"));
    }
    Ok((hour, minute))
}

fn parse_weekday(code: &str) -> Option<Weekday> {
    match code {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = spec
            .split_once(':')
            .ok_or_else(|| malformed(spec, "expected EVERY:, WEEKDAYS: or MONTHDAY:"))?;

        match kind {
            "EVERY" => {
                let (amount, multiplier) = if let Some(n) = rest.strip_suffix('h') {
                    (n, 3600)
                } else if let Some(n) = rest.strip_suffix('m') {
                    (n, 60)
                } else {
                    return Err(malformed(spec, "period must end with 'h' or 'm'"));
                };
                if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed(spec, "period must be a positive integer"));
                }
                let n: u64 = amount
                    .parse()
                    .map_err(|_| malformed(spec, "period is too large"))?;
                if n == 0 {
                    return Err(malformed(spec, "period must be a positive integer"));
                }
                let period_seconds = n
                    .checked_mul(multiplier)
                    .filter(|p| *p <= i64::MAX as u64)
                    .ok_or_else(|| malformed(spec, "period is too large"))?;
                Ok(ScheduleSpec::Every { period_seconds })
            }
            "WEEKDAYS" => {
                let (day_list, hhmm) = rest
                    .split_once('/')
                    .ok_or_else(|| malformed(spec, "expected WEEKDAYS:<days>/<HH:MM>"))?;
                let mut days = Vec::new();
                for code in day_list.split(':') {
                    let day = parse_weekday(code)
                        .ok_or_else(|| malformed(spec, format!("unknown weekday '{}'", code)))?;
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
                days.sort_by_key(|d| d.num_days_from_monday());
                let (hour, minute) = parse_time_of_day(spec, hhmm)?;
                Ok(ScheduleSpec::Weekdays { days, hour, minute })
            }
            "MONTHDAY" => {
                let (day_str, hhmm) = rest
                    .split_once('/')
                    .ok_or_else(|| malformed(spec, "expected MONTHDAY:<day>/<HH:MM>"))?;
                let day = match day_str {
                    "-1" => DayOfMonth::Last,
                    other => {
                        let d: u32 = other
                            .parse()
                            .map_err(|_| malformed(spec, "day must be 1..31 or -1"))?;
                        if !(1..=31).contains(&d) {
                            return Err(malformed(spec, "day must be 1..31 or -1"));
                        }
                        DayOfMonth::Day(d)
                    }
                };
                let (hour, minute) = parse_time_of_day(spec, hhmm)?;
                Ok(ScheduleSpec::Monthday { day, hour, minute })
            }
            _ => Err(malformed(spec, "expected EVERY:, WEEKDAYS: or MONTHDAY:")),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Every { period_seconds } if period_seconds % 3600 == 0 => {
                write!(f, "EVERY:{}h", period_seconds / 3600)
            }
            ScheduleSpec::Every { period_seconds } => write!(f, "EVERY:{}m", period_seconds / 60),
            ScheduleSpec::Weekdays { days, hour, minute } => {
                let codes: Vec<&str> = days.iter().map(|d| weekday_code(*d)).collect();
                write!(f, "WEEKDAYS:{}/{:02}:{:02}", codes.join(":"), hour, minute)
            }
            ScheduleSpec::Monthday { day, hour, minute } => {
                let day = match day {
                    DayOfMonth::Last => "-1".to_string(),
                    DayOfMonth::Day(d) => d.to_string(),
                };
                write!(f, "MONTHDAY:{}/{:02}:{:02}", day, hour, minute)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_every() {
        assert_eq!(
            "EVERY:2h".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Every { period_seconds: 7200 }
        );
        assert_eq!(
            "EVERY:15m".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Every { period_seconds: 900 }
        );
        assert!("EVERY:0h".parse::<ScheduleSpec>().is_err());
        assert!("EVERY:-3h".parse::<ScheduleSpec>().is_err());
        assert!("EVERY:3d".parse::<ScheduleSpec>().is_err());

        for huge in [
            "EVERY:307445734561825861m",
            "EVERY:5124095576030432h",
            "EVERY:2562047788015216h",
            "EVERY:99999999999999999999h",
        ] {
            assert_eq!(
                huge.parse::<ScheduleSpec>(),
                Err(ScheduleError::MalformedSpec {
                    spec: huge.to_string(),
                    reason: "period is too large".to_string(),
                })
            );
        }
    }

    #[test]
    fn test_parse_weekdays() {
        assert_eq!(
            "WEEKDAYS:MO:FR/10:30".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Weekdays {
                days: vec![Weekday::Mon, Weekday::Fri],
                hour: 10,
                minute: 30
            }
        );
        assert!("WEEKDAYS:MO:XX/10:30".parse::<ScheduleSpec>().is_err());
        assert!("WEEKDAYS:MO/25:00".parse::<ScheduleSpec>().is_err());
        assert!("WEEKDAYS:MO".parse::<ScheduleSpec>().is_err());
    }

    #[test]
    fn test_parse_monthday() {
        assert_eq!(
            "MONTHDAY:-1/23:59".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Monthday {
                day: DayOfMonth::Last,
                hour: 23,
                minute: 59
            }
        );
        assert!("MONTHDAY:0/10:00".parse::<ScheduleSpec>().is_err());
        assert!("MONTHDAY:32/10:00".parse::<ScheduleSpec>().is_err());
    }

    #[test]
    fn test_parse_bogus() {
        let err = "bogus".parse::<ScheduleSpec>().unwrap_err();
        assert!(matches!(err, ScheduleError::MalformedSpec { .. }));
        assert!("".parse::<ScheduleSpec>().is_err());
        assert!("HOURLY:1h".parse::<ScheduleSpec>().is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        for s in ["EVERY:2h", "EVERY:90m", "WEEKDAYS:MO:WE:FR/07:05", "MONTHDAY:-1/23:59"] {
            assert_eq!(s.parse::<ScheduleSpec>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_seed_hash_matches_rolling_definition() {
        assert_eq!(seed_hash(""), 0);
        assert_eq!(seed_hash("a"), 97);
        assert_eq!(seed_hash("ab"), 97 * 131 + 98);
    }

    #[test]
    fn test_every_within_one_period() {
        let spec = ScheduleSpec::Every { period_seconds: 300 };
        let t = utc("2026-03-01T12:00:07Z");
        let next = spec.next_run(t, "UTC", "xxx").unwrap();
        assert!(next > t);
        assert!(next <= t + Duration::seconds(300));
        let phase = phase_offset("xxx", 300) as i64;
        assert_eq!(next.timestamp().rem_euclid(300), phase);
    }

    #[test]
    fn test_every_phase_hit_advances_full_period() {
        let spec = ScheduleSpec::Every { period_seconds: 300 };
        let t = utc("2026-03-01T12:00:07Z");
        let first = spec.next_run(t, "UTC", "persona-42").unwrap();
        let second = spec.next_run(first, "UTC", "persona-42").unwrap();
        assert_eq!(second - first, Duration::seconds(300));
    }

    #[test]
    fn test_every_is_deterministic_per_seed() {
        let spec = ScheduleSpec::Every { period_seconds: 3600 };
        let t = utc("2026-03-01T00:00:00Z");
        let a = spec.next_run(t, "UTC", "alpha").unwrap();
        assert_eq!(a, spec.next_run(t, "UTC", "alpha").unwrap());
        // Same seed re-derived from the predecessor phase reproduces the same instant.
        assert_eq!(a, spec.next_run(a - Duration::seconds(3600), "UTC", "alpha").unwrap());
    }

    #[test]
    fn test_weekdays_next_run() {
        let spec: ScheduleSpec = "WEEKDAYS:MO:FR/10:30".parse().unwrap();
        // 2026-03-04 is a Wednesday
        let t = utc("2026-03-04T12:00:00Z");
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2026-03-06T10:30:00Z"));

        // Friday after 10:30 rolls to Monday
        let t = utc("2026-03-06T10:30:00Z");
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2026-03-09T10:30:00Z"));
    }

    #[test]
    fn test_weekdays_respects_timezone() {
        let spec: ScheduleSpec = "WEEKDAYS:MO/09:00".parse().unwrap();
        // Monday 2026-03-02 06:00 UTC is 09:00 in Europe/Moscow (UTC+3)
        let t = utc("2026-03-02T05:00:00Z");
        assert_eq!(
            spec.next_run(t, "Europe/Moscow", "").unwrap(),
            utc("2026-03-02T06:00:00Z")
        );
    }

    #[test]
    fn test_weekdays_same_day_later_time() {
        let spec: ScheduleSpec = "WEEKDAYS:WE/18:00".parse().unwrap();
        let t = utc("2026-03-04T12:00:00Z");
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2026-03-04T18:00:00Z"));
    }

    #[test]
    fn test_weekdays_skips_dst_gap_to_following_week() {
        // 02:30 does not exist in New York on 2026-03-08 (spring forward)
        let spec: ScheduleSpec = "WEEKDAYS:SU/02:30".parse().unwrap();
        let t = utc("2026-03-01T07:30:00Z");
        assert_eq!(
            spec.next_run(t, "America/New_York", "").unwrap(),
            utc("2026-03-15T06:30:00Z")
        );
    }

    #[test]
    fn test_monthday_skips_dst_gap_to_following_month() {
        let spec: ScheduleSpec = "MONTHDAY:8/02:30".parse().unwrap();
        let t = utc("2026-02-08T07:30:00Z");
        assert_eq!(
            spec.next_run(t, "America/New_York", "").unwrap(),
            utc("2026-04-08T06:30:00Z")
        );
    }

    #[test]
    fn test_monthday_last_day() {
        let spec: ScheduleSpec = "MONTHDAY:-1/23:59".parse().unwrap();
        let t = utc("2026-02-10T00:00:00Z");
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2026-02-28T23:59:00Z"));
        let t = utc("2028-02-10T00:00:00Z");
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2028-02-29T23:59:00Z"));
    }

    #[test]
    fn test_monthday_skips_short_months() {
        let spec: ScheduleSpec = "MONTHDAY:31/08:00".parse().unwrap();
        let t = utc("2026-01-31T09:00:00Z");
        // February and April lack a 31st; March has one.
        assert_eq!(spec.next_run(t, "UTC", "").unwrap(), utc("2026-03-31T08:00:00Z"));
    }

    #[test]
    fn test_last_day_of_month_helper() {
        assert_eq!(last_day_of_month(2026, 4).unwrap().day(), 30);
        assert_eq!(last_day_of_month(2026, 12).unwrap().day(), 31);
        assert_eq!(last_day_of_month(2026, 2).unwrap().day(), 28);
    }

    #[test]
    fn test_unknown_timezone() {
        let spec: ScheduleSpec = "EVERY:1h".parse().unwrap();
        let err = spec
            .next_run(Utc::now(), "Mars/Olympus_Mons", "seed")
            .unwrap_err();
        assert_eq!(err, ScheduleError::UnknownTimezone("Mars/Olympus_Mons".to_string()));
    }
}
