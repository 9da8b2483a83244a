//! Next-fire-time computation
//!
//! Cron parsing lives outside this crate. The executor only needs "when does
//! this schedule fire next", behind [`NextRunCalculator`].

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Errors computing the next fire time
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("no upcoming fire time for '{0}'")]
    Exhausted(String),
}

/// Computes when a schedule fires next
pub trait NextRunCalculator: Send + Sync + 'static {
    fn next_run(
        &self,
        cron_expr: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError>;
}

impl<F> NextRunCalculator for F
where
    F: Fn(&str, &str, DateTime<Utc>) -> Result<DateTime<Utc>, CronError> + Send + Sync + 'static,
{
    fn next_run(
        &self,
        cron_expr: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        self(cron_expr, timezone, after)
    }
}

/// Fires every `interval`, whatever the expression says
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl NextRunCalculator for FixedInterval {
    fn next_run(
        &self,
        cron_expr: &str,
        _timezone: &str,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        let step =
            chrono::Duration::from_std(self.interval).map_err(|e| CronError::InvalidExpression {
                expr: cron_expr.to_string(),
                reason: e.to_string(),
            })?;
        after
            .checked_add_signed(step)
            .ok_or_else(|| CronError::Exhausted(cron_expr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval() {
        let now = Utc::now();
        let next = FixedInterval::new(Duration::from_secs(60))
            .next_run("* * * * *", "UTC", now)
            .unwrap();
        assert_eq!(next - now, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_closure_calculator() {
        let failing = |expr: &str, _tz: &str, _after: DateTime<Utc>| -> Result<DateTime<Utc>, CronError> {
            Err(CronError::InvalidExpression {
                expr: expr.to_string(),
                reason: "bad field".into(),
            })
        };
        let result = failing.next_run("nope", "UTC", Utc::now());
        assert!(matches!(result, Err(CronError::InvalidExpression { .. })));
    }
}
