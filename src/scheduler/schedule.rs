//! Compiled schedule definitions.

use crate::error::{HubError, Result};
use crate::manifest::ScheduleSpec;
use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use croner::Cron;
use std::time::Duration;

/// Time zone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronZone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl CronZone {
    fn parse(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.map(str::trim) else {
            return Ok(Self::Utc);
        };
        if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") || raw.is_empty() {
            return Ok(Self::Utc);
        }
        if raw.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        parse_offset(raw).map(Self::Fixed).ok_or_else(|| {
            HubError::validation(format!(
                "unsupported timezone `{raw}` (use UTC, local, or an offset like +02:00)"
            ))
        })
    }
}

/// `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// A validated [`ScheduleSpec`] that can compute fire times.
#[derive(Debug, Clone)]
pub struct Schedule(Compiled);

#[derive(Debug, Clone)]
enum Compiled {
    Cron { cron: Box<Cron>, zone: CronZone },
    Interval(Duration),
    Once(DateTime<Utc>),
}

impl Schedule {
    /// Validates and compiles a schedule spec.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for unparseable cron expressions,
    /// unsupported timezones, or zero-length intervals.
    pub fn compile(spec: &ScheduleSpec) -> Result<Self> {
        match spec {
            ScheduleSpec::Cron {
                expression,
                timezone,
            } => {
                let expression = expression.trim();
                if expression.is_empty() {
                    return Err(HubError::validation("cron expression cannot be empty"));
                }
                let cron = Cron::new(expression).parse().map_err(|e| {
                    HubError::validation(format!("invalid cron expression `{expression}`: {e}"))
                })?;
                let zone = CronZone::parse(timezone.as_deref())?;
                Ok(Self(Compiled::Cron {
                    cron: Box::new(cron),
                    zone,
                }))
            }
            ScheduleSpec::Interval {
                weeks,
                days,
                hours,
                minutes,
                seconds,
            } => {
                let total = weeks
                    .checked_mul(604_800)
                    .and_then(|t| t.checked_add(days.checked_mul(86_400)?))
                    .and_then(|t| t.checked_add(hours.checked_mul(3600)?))
                    .and_then(|t| t.checked_add(minutes.checked_mul(60)?))
                    .and_then(|t| t.checked_add(*seconds))
                    .ok_or_else(|| HubError::validation("interval is too large"))?;
                if total == 0 {
                    return Err(HubError::validation("interval must be at least one second"));
                }
                Ok(Self(Compiled::Interval(Duration::from_secs(total))))
            }
            ScheduleSpec::Date { run_at } => Ok(Self(Compiled::Once(*run_at))),
        }
    }

    /// First fire time strictly after `after`, or `None` when exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.0 {
            Compiled::Cron { cron, zone } => match zone {
                CronZone::Utc => next_in_zone(cron, &after),
                CronZone::Local => next_in_zone(cron, &after.with_timezone(&Local)),
                CronZone::Fixed(offset) => next_in_zone(cron, &after.with_timezone(offset)),
            },
            Compiled::Interval(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                after.checked_add_signed(period)
            }
            Compiled::Once(at) => (*at > after).then_some(*at),
        }
    }
}

fn next_in_zone<Tz: TimeZone>(cron: &Cron, after: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(after, false)
        .ok()
        .map(|next| next.with_timezone(&Utc))
}
