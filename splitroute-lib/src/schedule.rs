//! Cron driven timers.
//!
//! A [`Schedule`] wraps a cron expression. [`run`] drives one schedule in its own task,
//! calling an action at every occurrence until the cancellation token fires. Scheduled
//! actions only enqueue signals or perform isolated side effects; they never touch
//! routing state directly.
use chrono::{DateTime, Local, TimeZone};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::fmt::{self, Display};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cron expression `{expression}`: {reason}")]
    Invalid { expression: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct Schedule {
    expression: String,
    inner: cron::Schedule,
}

impl Schedule {
    /// Parses a cron expression with a leading seconds field (6 or 7 fields).
    /// Classic 5 field expressions are accepted and fire at second zero.
    pub fn parse(expression: &str) -> Result<Self, Error> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_string(),
        };
        let inner = cron::Schedule::from_str(&normalized).map_err(|e| Error::Invalid {
            expression: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Schedule {
            expression: trimmed.to_string(),
            inner,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.inner.after(after).next()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// Runs `action` at every occurrence of `schedule` until `cancel` fires.
///
/// Occurrences are anchored on the previous target time, so an early timer wake-up
/// cannot fire the same occurrence twice.
pub async fn run<F, Fut>(name: &'static str, schedule: Schedule, cancel: CancellationToken, mut action: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tracing::info!(schedule = name, expression = %schedule, "schedule started");
    let mut anchor: Option<DateTime<Local>> = None;
    loop {
        let now = Local::now();
        let from = match anchor {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let next = match schedule.next_after(&from) {
            Some(next) => next,
            None => {
                tracing::warn!(schedule = name, "schedule has no upcoming occurrence - stopping");
                return;
            }
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(schedule = name, %next, "waiting for next occurrence");

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(schedule = name, "schedule stopped");
                return;
            }
            _ = time::sleep(delay) => {
                anchor = Some(next);
                tracing::debug!(schedule = name, "schedule triggered");
                action().await;
            }
        }
    }
}
