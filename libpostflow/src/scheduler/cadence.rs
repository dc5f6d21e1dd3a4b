//! Job cadences
//!
//! Accepted forms:
//!
//! - `every <duration>`: fixed interval from the previous fire, e.g. `every 1m`
//! - `hourly at :MM`: once an hour at minute `MM` (UTC)
//! - `every <N>h at :MM`: at minute `MM` of every hour divisible by `N`

use chrono::{DateTime, TimeDelta, Utc};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    EveryHours { hours: u32, minute: u32 },
}

impl Cadence {
    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(interval) => {
                let step = TimeDelta::from_std(interval).unwrap_or_else(|_| TimeDelta::days(365));
                after + step
            }
            Cadence::EveryHours { hours, minute } => {
                let ts = after.timestamp();
                let hour_start = ts - ts.rem_euclid(3600);
                let mut candidate = hour_start + i64::from(minute) * 60;

                // At most one day of hours to scan
                for _ in 0..=48 {
                    let hour_of_day = candidate.div_euclid(3600).rem_euclid(24);
                    if candidate > ts && hour_of_day % i64::from(hours) == 0 {
                        break;
                    }
                    candidate += 3600;
                }

                DateTime::from_timestamp(candidate, 0).unwrap_or(after)
            }
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        if let Some(rest) = s.strip_prefix("hourly") {
            let minute = match rest.trim() {
                "" => 0,
                at => parse_minute(at)?,
            };
            return Ok(Cadence::EveryHours { hours: 1, minute });
        }

        let Some(rest) = s.strip_prefix("every ") else {
            return Err(format!(
                "Invalid cadence '{}': expected 'every <duration>', 'hourly at :MM' or 'every <N>h at :MM'",
                s
            ));
        };

        if let Some((hours, at)) = rest.split_once(" at ") {
            let hours: u32 = hours
                .trim()
                .strip_suffix('h')
                .and_then(|h| h.trim().parse().ok())
                .ok_or_else(|| format!("Invalid hour interval in cadence '{}'", s))?;
            if hours == 0 || hours > 24 {
                return Err(format!("Hour interval must be between 1 and 24 in '{}'", s));
            }
            let minute = parse_minute(&format!("at {}", at.trim()))?;
            return Ok(Cadence::EveryHours { hours, minute });
        }

        let interval = humantime::parse_duration(rest.trim())
            .map_err(|e| format!("Invalid interval in cadence '{}': {}", s, e))?;
        if interval.is_zero() {
            return Err(format!("Cadence interval must be positive in '{}'", s));
        }
        Ok(Cadence::Every(interval))
    }
}

fn parse_minute(at: &str) -> Result<u32, String> {
    let minute = at
        .trim()
        .strip_prefix("at")
        .map(str::trim)
        .and_then(|m| m.strip_prefix(':'))
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or_else(|| format!("Invalid minute '{}': expected 'at :MM'", at.trim()))?;

    if minute > 59 {
        return Err(format!("Minute must be between 0 and 59, got {}", minute));
    }
    Ok(minute)
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(interval) => write!(f, "every {}", humantime::format_duration(*interval)),
            Cadence::EveryHours { hours: 1, minute } => write!(f, "hourly at :{:02}", minute),
            Cadence::EveryHours { hours, minute } => write!(f, "every {}h at :{:02}", hours, minute),
        }
    }
}
