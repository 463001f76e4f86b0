use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// How a workflow is triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Manual,
    /// `time` holds the interval in minutes.
    Interval,
    /// `time` holds a cron expression (seconds field first).
    Cron,
}

/// Trigger settings stored in workflow metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_time() -> String {
    "09:00".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            frequency: Frequency::Manual,
            time: default_time(),
            timezone: default_timezone(),
        }
    }
}

impl Schedule {
    pub fn interval(minutes: u32) -> Self {
        Self {
            frequency: Frequency::Interval,
            time: minutes.to_string(),
            ..Default::default()
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            frequency: Frequency::Cron,
            time: expr.into(),
            ..Default::default()
        }
    }

    /// Check that the schedule can be evaluated.
    pub fn check(&self) -> Result<(), String> {
        parse_timezone(&self.timezone)?;
        match self.frequency {
            Frequency::Manual => Ok(()),
            Frequency::Interval => interval_minutes(&self.time).map(|_| ()),
            Frequency::Cron => parse_cron(&self.time).map(|_| ()),
        }
    }

    /// Next trigger time strictly after `after`; `None` for manual workflows.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
        match self.frequency {
            Frequency::Manual => Ok(None),
            Frequency::Interval => {
                let minutes = interval_minutes(&self.time)?;
                Ok(Some(after + Duration::minutes(i64::from(minutes))))
            }
            Frequency::Cron => {
                let schedule = parse_cron(&self.time)?;
                Ok(match parse_timezone(&self.timezone)? {
                    Zone::Named(tz) => next_in(&schedule, after, &tz),
                    Zone::Fixed(offset) => next_in(&schedule, after, &offset),
                })
            }
        }
    }
}

/// Timezone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Zone {
    /// IANA zone such as `Europe/Paris`; follows daylight saving.
    Named(Tz),
    Fixed(FixedOffset),
}

fn next_in<Z: TimeZone>(
    schedule: &cron::Schedule,
    after: DateTime<Utc>,
    zone: &Z,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(zone))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

fn interval_minutes(time: &str) -> Result<u32, String> {
    match time.trim().parse::<u32>() {
        Ok(0) => Err("interval must be at least one minute".to_string()),
        Ok(m) => Ok(m),
        Err(_) => Err(format!("interval '{}' is not a number of minutes", time)),
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    cron::Schedule::from_str(expr.trim())
        .map_err(|e| format!("invalid cron expression '{}': {}", expr, e))
}

/// Parse `UTC`, an IANA zone name, or a fixed `±HH:MM` offset.
fn parse_timezone(tz: &str) -> Result<Zone, String> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("gmt") || tz == "Z"
    {
        return Ok(Zone::Named(Tz::UTC));
    }
    if let Ok(named) = Tz::from_str(tz) {
        return Ok(Zone::Named(named));
    }
    parse_offset(tz).map(Zone::Fixed)
}

fn parse_offset(tz: &str) -> Result<FixedOffset, String> {
    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(format!("unsupported timezone '{}'", tz));
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("unsupported timezone '{}'", tz))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("unsupported timezone '{}'", tz))?;
    if hours > 14 || minutes > 59 {
        return Err(format!("timezone offset '{}' out of range", tz));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("timezone offset '{}' out of range", tz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_never_fires() {
        let s = Schedule::default();
        assert!(s.check().is_ok());
        assert_eq!(s.next_fire(Utc::now()).unwrap(), None);
    }

    #[test]
    fn interval_adds_minutes() {
        let s = Schedule::interval(15);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let next = s.next_fire(now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 8, 15, 0).unwrap());
    }

    #[test]
    fn zero_interval_rejected() {
        assert!(Schedule::interval(0).check().is_err());
    }

    #[test]
    fn cron_respects_offset() {
        let mut s = Schedule::cron("0 0 9 * * *");
        s.timezone = "+02:00".into();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = s.next_fire(now).unwrap().unwrap();
        // 09:00 at UTC+2 is 07:00 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn malformed_schedules() {
        assert!(Schedule::cron("every tuesday").check().is_err());
        let mut s = Schedule::interval(5);
        s.timezone = "Mars/Olympus".into();
        assert!(s.check().is_err());
    }

    #[test]
    fn cron_follows_named_zone_across_dst() {
        let mut s = Schedule::cron("0 0 9 * * *");
        s.timezone = "America/New_York".into();
        assert!(s.check().is_ok());

        // EST in winter, EDT in summer
        let winter = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(
            s.next_fire(winter).unwrap().unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap()
        );
        let summer = Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap();
        assert_eq!(
            s.next_fire(summer).unwrap().unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 15, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("UTC").unwrap(), Zone::Named(Tz::UTC));
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap(),
            Zone::Named(Tz::Europe__Paris)
        );
        assert_eq!(
            parse_timezone("-05:30").unwrap(),
            Zone::Fixed(FixedOffset::west_opt(5 * 3600 + 1800).unwrap())
        );
        assert_eq!(parse_offset("+3").unwrap().local_minus_utc(), 3 * 3600);
        assert!(parse_offset("+25:00").is_err());
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
