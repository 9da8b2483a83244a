//! Scoped ownership of a claimed schedule
//!
//! A [`ScheduleLease`] is created right after a schedule is claimed and must
//! be given back with [`ScheduleLease::release`]. If the owning future is
//! dropped first (task aborted, runtime shutting down), `Drop` marks the
//! in-flight attempt cancelled and releases the lock in the background.
//! The lease only counts as released once the store has answered, so a
//! release interrupted mid-call is retried by `Drop`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

use runwarden_schemas::{Schedule, ScheduleRunStatus, ScheduleRunUpdate};

use super::cron::{CronError, NextRunCalculator};
use crate::persistence::{ScheduleStore, StoreError};

/// What happened to the schedule on release
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Unlocked and due again at the given time
    Rearmed(DateTime<Utc>),
    /// Next fire time could not be computed; unlocked and disabled
    Disabled(CronError),
}

/// Update written to an attempt interrupted by cancellation
pub fn cancelled_update(reason: &str) -> ScheduleRunUpdate {
    ScheduleRunUpdate {
        error: Some(reason.to_string()),
        ..ScheduleRunUpdate::finished(ScheduleRunStatus::Cancelled)
    }
}

#[derive(Clone)]
struct Releaser {
    store: Arc<dyn ScheduleStore>,
    calculator: Arc<dyn NextRunCalculator>,
    schedule_id: Uuid,
    name: String,
    cron_expr: String,
    timezone: String,
}

impl Releaser {
    /// Close an attempt record that was left running
    async fn finalize(&self, run_id: Uuid, reason: &str) {
        if let Err(e) = self
            .store
            .update_schedule_run(run_id, cancelled_update(reason))
            .await
        {
            error!(%run_id, error = %e, "failed to mark attempt cancelled");
        }
    }

    async fn release(self) -> Result<ReleaseOutcome, StoreError> {
        match self
            .calculator
            .next_run(&self.cron_expr, &self.timezone, Utc::now())
        {
            Ok(next_run_at) => {
                self.store
                    .release_schedule(self.schedule_id, Some(next_run_at))
                    .await?;
                info!(
                    schedule_id = %self.schedule_id,
                    name = %self.name,
                    %next_run_at,
                    "schedule released"
                );
                Ok(ReleaseOutcome::Rearmed(next_run_at))
            }
            Err(e) => {
                error!(
                    schedule_id = %self.schedule_id,
                    name = %self.name,
                    cron_expr = %self.cron_expr,
                    error = %e,
                    "cannot compute next run; disabling schedule"
                );
                // Unlock even if disabling fails
                let disabled = self.store.update_schedule(self.schedule_id, false).await;
                let released = self.store.release_schedule(self.schedule_id, None).await;
                disabled?;
                released?;
                Ok(ReleaseOutcome::Disabled(e))
            }
        }
    }
}

/// Guard over a claimed schedule's lock
pub struct ScheduleLease {
    releaser: Releaser,
    in_flight: Option<Uuid>,
    released: bool,
}

impl ScheduleLease {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        calculator: Arc<dyn NextRunCalculator>,
        schedule: &Schedule,
    ) -> Self {
        Self {
            releaser: Releaser {
                store,
                calculator,
                schedule_id: schedule.id,
                name: schedule.name.clone(),
                cron_expr: schedule.cron_expr.clone(),
                timezone: schedule.timezone.clone(),
            },
            in_flight: None,
            released: false,
        }
    }

    pub fn schedule_id(&self) -> Uuid {
        self.releaser.schedule_id
    }

    /// Attempt record currently executing under this lease
    pub fn in_flight(&self) -> Option<Uuid> {
        self.in_flight
    }

    pub fn track(&mut self, run_id: Uuid) {
        self.in_flight = Some(run_id);
    }

    pub fn clear(&mut self) {
        self.in_flight = None;
    }

    /// Close any attempt still tracked, compute the next fire time and unlock
    pub async fn release(mut self) -> Result<ReleaseOutcome, StoreError> {
        if let Some(run_id) = self.in_flight {
            warn!(%run_id, "attempt still open at release; marking it cancelled");
            self.releaser
                .finalize(run_id, "attempt outcome could not be recorded")
                .await;
            self.in_flight = None;
        }
        let outcome = self.releaser.clone().release().await;
        self.released = true;
        outcome
    }
}

impl Drop for ScheduleLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let releaser = self.releaser.clone();
        let in_flight = self.in_flight.take();
        let Ok(runtime) = Handle::try_current() else {
            error!(
                schedule_id = %releaser.schedule_id,
                "lease dropped outside a runtime; schedule stays locked"
            );
            return;
        };

        warn!(
            schedule_id = %releaser.schedule_id,
            "schedule execution dropped before release; releasing in background"
        );
        runtime.spawn(async move {
            if let Some(run_id) = in_flight {
                releaser
                    .finalize(run_id, "schedule execution was interrupted")
                    .await;
            }
            let schedule_id = releaser.schedule_id;
            if let Err(e) = releaser.release().await {
                error!(%schedule_id, error = %e, "failed to release schedule");
            }
        });
    }
}
