//! Job triggers: cron (seconds through year) and fixed interval, evaluated in
//! one explicit timezone.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Upper bound on fire times enumerated for one job in one tick.
const MAX_CATCH_UP: usize = 1_000;

/// Longest accepted interval (about 68 years).
pub const MAX_INTERVAL_SECONDS: u64 = i32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// `sec min hour day-of-month month day-of-week [year]`
    Cron { expression: String },
    /// Every `seconds`, aligned to `start_at` when given
    Interval {
        seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_at: Option<DateTime<Utc>>,
    },
}

impl JobTrigger {
    pub fn cron(expression: impl Into<String>) -> Self {
        JobTrigger::Cron {
            expression: expression.into(),
        }
    }

    pub fn every_seconds(seconds: u64) -> Self {
        JobTrigger::Interval {
            seconds,
            start_at: None,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        match self {
            JobTrigger::Cron { expression } => parse_cron(expression).map(|_| ()),
            JobTrigger::Interval { seconds, .. } if *seconds == 0 => Err(CoreError::Validation(
                "interval trigger needs seconds > 0".into(),
            )),
            JobTrigger::Interval { seconds, .. } if *seconds > MAX_INTERVAL_SECONDS => {
                Err(CoreError::Validation(format!(
                    "interval trigger seconds must be at most {MAX_INTERVAL_SECONDS}, got {seconds}"
                )))
            }
            JobTrigger::Interval { .. } => Ok(()),
        }
    }

    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let trigger: JobTrigger = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::Validation(format!("malformed trigger spec: {e}")))?;
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// First fire time strictly after `after`; `None` once the schedule is exhausted.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> CoreResult<Option<DateTime<Utc>>> {
        match self {
            JobTrigger::Cron { expression } => {
                let schedule = parse_cron(expression)?;
                Ok(schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|at| at.with_timezone(&Utc)))
            }
            JobTrigger::Interval { seconds, start_at } => {
                self.validate()?;
                let step = i64::try_from(*seconds).map_err(|_| interval_overflow(*seconds))?;
                let next = match start_at {
                    Some(anchor) if after < *anchor => Some(*anchor),
                    Some(anchor) => {
                        let elapsed = (after - *anchor).num_seconds();
                        let periods = elapsed / step + 1;
                        step.checked_mul(periods)
                            .and_then(Duration::try_seconds)
                            .and_then(|offset| anchor.checked_add_signed(offset))
                    }
                    None => Duration::try_seconds(step)
                        .and_then(|offset| after.checked_add_signed(offset)),
                };
                next.map(Some).ok_or_else(|| interval_overflow(*seconds))
            }
        }
    }
}

fn interval_overflow(seconds: u64) -> CoreError {
    CoreError::Validation(format!(
        "interval trigger of {seconds}s overflows the supported time range"
    ))
}

fn parse_cron(expression: &str) -> CoreResult<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| CoreError::Validation(format!("invalid cron expression '{expression}': {e}")))
}

/// What one tick should do with a job whose next fire time has passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiringPlan {
    /// Firings to dispatch now
    pub run: usize,
    /// Due times older than the misfire grace, skipped
    pub misfired: usize,
    /// Due times folded into one firing by coalescing
    pub coalesced: usize,
    /// Next nominal fire time after `now`
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Enumerates fire times from `scheduled` up to `now` and applies the
/// misfire grace and coalescing rules.
pub fn plan_firings(
    trigger: &JobTrigger,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Duration,
    coalesce: bool,
    tz: Tz,
) -> CoreResult<FiringPlan> {
    let mut due = Vec::new();
    let mut cursor = Some(scheduled);
    while let Some(at) = cursor {
        if at > now || due.len() >= MAX_CATCH_UP {
            break;
        }
        due.push(at);
        cursor = trigger.next_after(at, tz)?;
    }
    // A backlog beyond the cap is skipped forward to the first time after now.
    if let Some(at) = cursor
        && at <= now
    {
        cursor = trigger.next_after(now, tz)?;
    }

    let (runnable, late): (Vec<_>, Vec<_>) = due.into_iter().partition(|at| now - *at <= grace);
    let (run, coalesced) = match runnable.len() {
        0 => (0, 0),
        n if coalesce => (1, n - 1),
        n => (n, 0),
    };

    Ok(FiringPlan {
        run,
        misfired: late.len(),
        coalesced,
        next_run_at: cursor,
    })
}

/// Delays `at` by a random `0..=jitter_seconds`.
pub fn apply_jitter<R: Rng + ?Sized>(
    at: DateTime<Utc>,
    jitter_seconds: Option<i32>,
    rng: &mut R,
) -> DateTime<Utc> {
    match jitter_seconds {
        Some(max) if max > 0 => at + Duration::seconds(rng.gen_range(0..=max as i64)),
        _ => at,
    }
}
