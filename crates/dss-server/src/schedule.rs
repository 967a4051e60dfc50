//! Operator-configurable schedules: the startup backoff sequence and the
//! trigger schedule for periodic jobs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Default startup backoff sequence.
pub const DEFAULT_STARTUP_BACKOFF: &str = "5s,15s,1m,1m,1m,5m";

/// Parse a duration such as `250ms`, `30s`, `5m`, `2h` or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let text = input.trim();
    if text.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let invalid = || Error::Config(format!("invalid duration {input:?}"));
    let mut total = Duration::ZERO;
    let mut rest = text;

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| Error::Config(format!("duration {input:?} is too large")))?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Fixed escalating delays between startup attempts. The last delay
/// repeats for every attempt beyond the end of the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Create a schedule from an explicit, non-empty list of delays.
    pub fn new(delays: Vec<Duration>) -> Result<Self, Error> {
        if delays.is_empty() {
            return Err(Error::Config("backoff schedule needs at least one delay".to_string()));
        }
        Ok(Self { delays })
    }

    /// Delay after the `failures`-th consecutive failure (zero-based).
    pub fn delay(&self, failures: usize) -> Duration {
        let last = self.delays.len() - 1;
        self.delays[failures.min(last)]
    }

    /// The configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
        }
    }
}

impl FromStr for BackoffSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let delays = s
            .split(',')
            .map(parse_duration)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(delays)
    }
}

/// When a periodic job fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// `@every <duration>`: a fixed period.
    Every(Duration),
    /// A cron expression (seconds resolution).
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Time to wait from `now` until the next trigger.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(period) => Some(*period),
            Schedule::Cron(schedule) => schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Some(period) = text.strip_prefix("@every") {
            let period = parse_duration(period)?;
            if period.is_zero() {
                return Err(Error::Config(format!("schedule {s:?} has a zero period")));
            }
            return Ok(Schedule::Every(period));
        }

        cron::Schedule::from_str(text)
            .map(|schedule| Schedule::Cron(Box::new(schedule)))
            .map_err(|e| Error::Config(format!("invalid schedule {s:?}: {e}")))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(period) => write!(f, "@every {period:?}"),
            Schedule::Cron(schedule) => write!(f, "{schedule}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 2h ").unwrap(), Duration::from_secs(7200));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("3 days").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(matches!(
            parse_duration("307445734561825861m"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_duration("18446744073709551615h"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_duration("18446744073709551615s18446744073709551615s"),
            Err(Error::Config(_))
        ));
        assert!("5s,307445734561825861m".parse::<BackoffSchedule>().is_err());
        assert!("@every 307445734561825861m".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_default_backoff() {
        let schedule: BackoffSchedule = DEFAULT_STARTUP_BACKOFF.parse().unwrap();
        assert_eq!(schedule, BackoffSchedule::default());
    }

    #[test]
    fn test_backoff_escalates_then_repeats_last() {
        let schedule = BackoffSchedule::default();
        let observed: Vec<_> = (0..9).map(|i| schedule.delay(i).as_secs()).collect();
        assert_eq!(observed, [5, 15, 60, 60, 60, 300, 300, 300, 300]);
    }

    #[test]
    fn test_backoff_rejects_empty() {
        assert!(BackoffSchedule::new(Vec::new()).is_err());
        assert!("5s,,1m".parse::<BackoffSchedule>().is_err());
    }

    #[test]
    fn test_every_schedule() {
        let schedule: Schedule = "@every 30m".parse().unwrap();
        assert_eq!(
            schedule.next_delay(Utc::now()),
            Some(Duration::from_secs(1800))
        );
        assert!("@every 0s".parse::<Schedule>().is_err());
        assert!("@every soon".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_cron_schedule() {
        // Second 0 of every 15th minute.
        let schedule: Schedule = "0 */15 * * * *".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 7, 30).unwrap();
        assert_eq!(
            schedule.next_delay(now),
            Some(Duration::from_secs(7 * 60 + 30))
        );
    }

    #[test]
    fn test_invalid_cron_schedule() {
        assert!(matches!(
            "every now and then".parse::<Schedule>(),
            Err(Error::Config(_))
        ));
    }
}
