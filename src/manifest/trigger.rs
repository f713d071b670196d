//! Trigger bindings: what makes a task instance run.
//!
//! ```toml
//! [trigger]
//! type = "event"
//! [trigger.config]
//! topic = "sensors/+/temp"
//! max_hops = 2
//! ```
//!
//! ```toml
//! [trigger]
//! type = "schedule"
//! [trigger.config]
//! trigger = "cron"
//! expression = "*/5 * * * *"
//! ```

use crate::error::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The declared trigger kind of a module template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Schedule,
    Event,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => f.write_str("schedule"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// Exactly one binding per task instance.
///
/// Bindings are replaced wholesale, never edited in place: changing any
/// parameter unbinds the old one and binds the new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum TriggerBinding {
    /// Time-based trigger handled by the trigger engine.
    Schedule(ScheduleSpec),
    /// Bus subscription.
    Event(EventSpec),
}

impl TriggerBinding {
    /// The kind of this binding.
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::Schedule(_) => TriggerKind::Schedule,
            Self::Event(_) => TriggerKind::Event,
        }
    }

    /// Validates the binding's parameters.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] when a cron expression does not parse,
    /// an interval is zero, or a topic filter is malformed.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Schedule(spec) => crate::scheduler::Schedule::compile(spec).map(|_| ()),
            Self::Event(spec) => spec.validate(),
        }
    }
}

/// Schedule parameters, tagged by `trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Five-field crontab expression.
    Cron {
        #[serde(alias = "cron_expression")]
        expression: String,
        /// `UTC` (default), `local`, or a fixed offset such as `+02:00`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fixed period; the fields are summed.
    Interval {
        #[serde(default, skip_serializing_if = "is_zero")]
        weeks: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        days: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        hours: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        minutes: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        seconds: u64,
    },
    /// Runs once at the given instant.
    Date {
        #[serde(alias = "run_date")]
        run_at: DateTime<Utc>,
    },
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl ScheduleSpec {
    /// An interval spec of `seconds` seconds.
    pub fn every_secs(seconds: u64) -> Self {
        Self::Interval {
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds,
        }
    }

    /// A cron spec evaluated in UTC.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => match timezone {
                Some(tz) => write!(f, "cron `{expression}` ({tz})"),
                None => write!(f, "cron `{expression}`"),
            },
            Self::Interval {
                weeks,
                days,
                hours,
                minutes,
                seconds,
            } => {
                let total = weeks * 604_800 + days * 86_400 + hours * 3600 + minutes * 60 + seconds;
                write!(f, "every {total}s")
            }
            Self::Date { run_at } => write!(f, "once at {}", run_at.to_rfc3339()),
        }
    }
}

/// Event subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    /// Topic filter; `+` and `#` wildcards are allowed.
    pub topic: String,
    /// Per-task hop ceiling. `None` uses `task_defaults.event_max_hops`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<u32>,
}

impl EventSpec {
    /// Subscription on `topic` with the default hop ceiling.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            max_hops: None,
        }
    }

    /// Sets an explicit hop ceiling.
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = Some(max_hops);
        self
    }

    fn validate(&self) -> Result<()> {
        crate::bus::validate_filter(&self.topic).map_err(|e| HubError::Validation {
            reason: format!("trigger topic: {e}"),
        })
    }
}
