//! Schedule executor
//!
//! Runs one claimed schedule to completion: one `ScheduleRun` per attempt,
//! retries with a fixed delay, bounded polling for background runs, and an
//! unconditional release of the schedule lock at the end.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use runwarden_schemas::{
    RunStatus, Schedule, ScheduleRun, ScheduleRunStatus, ScheduleRunUpdate,
};

use super::client::{background_target, RunApi, RunApiError, RunSnapshot, RunTarget};
use super::cron::NextRunCalculator;
use super::lease::{cancelled_update, ReleaseOutcome, ScheduleLease};
use crate::persistence::{ScheduleStore, StoreError};

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Fixed interval between run-status polls
    #[serde(with = "crate::config::duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run-status polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cancelled mid-flight; the in-flight attempt was marked cancelled
    #[error("execution of schedule {0} was cancelled")]
    Cancelled(Uuid),
}

/// Executes schedules against the run API
pub struct ScheduleExecutor {
    store: Arc<dyn ScheduleStore>,
    api: Arc<dyn RunApi>,
    calculator: Arc<dyn NextRunCalculator>,
    config: ExecutorConfig,
}

impl ScheduleExecutor {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        api: Arc<dyn RunApi>,
        calculator: Arc<dyn NextRunCalculator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            api,
            calculator,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a claimed schedule and release it
    ///
    /// Returns the last attempt's record. The lock is released on every
    /// path, including store errors and cancellation.
    #[instrument(skip(self, schedule, cancel), fields(schedule_id = %schedule.id, name = %schedule.name))]
    pub async fn execute(
        &self,
        schedule: &Schedule,
        cancel: CancellationToken,
    ) -> Result<ScheduleRun, ExecutorError> {
        let mut lease = ScheduleLease::new(
            Arc::clone(&self.store),
            Arc::clone(&self.calculator),
            schedule,
        );

        let result = self.run_attempts(schedule, &mut lease, &cancel).await;

        match lease.release().await {
            Ok(ReleaseOutcome::Rearmed(_)) => {}
            Ok(ReleaseOutcome::Disabled(_)) => {
                warn!("schedule disabled after execution");
            }
            Err(e) => error!(error = %e, "failed to release schedule"),
        }

        match &result {
            Ok(run) => info!(
                attempt = run.attempt,
                status = %run.status,
                "schedule execution finished"
            ),
            Err(e) => warn!(error = %e, "schedule execution aborted"),
        }
        result
    }

    async fn run_attempts(
        &self,
        schedule: &Schedule,
        lease: &mut ScheduleLease,
        cancel: &CancellationToken,
    ) -> Result<ScheduleRun, ExecutorError> {
        let max_attempts = schedule.max_attempts();
        let mut attempt = 1;

        loop {
            let mut run = ScheduleRun::start(schedule.id, attempt);
            self.store.create_schedule_run(&run).await?;
            lease.track(run.id);
            debug!(attempt, max_attempts, run_id = %run.id, "starting attempt");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                update = self.attempt(schedule) => Some(update),
            };
            let Some(update) = outcome else {
                self.record(run.id, &cancelled_update("schedule execution was cancelled"))
                    .await?;
                lease.clear();
                return Err(ExecutorError::Cancelled(schedule.id));
            };

            // On failure the attempt stays tracked and the lease closes it
            self.record(run.id, &update).await?;
            lease.clear();
            run.apply(&update);

            if run.status.ends_retries() || attempt >= max_attempts {
                return Ok(run);
            }

            warn!(
                attempt,
                max_attempts,
                error = run.error.as_deref().unwrap_or_default(),
                retry_in_secs = schedule.retry_delay_seconds,
                "attempt failed; retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled(schedule.id)),
                _ = tokio::time::sleep(Duration::from_secs(schedule.retry_delay_seconds)) => {}
            }
            attempt += 1;
        }
    }

    /// Write an attempt's outcome, retrying once
    async fn record(&self, run_id: Uuid, update: &ScheduleRunUpdate) -> Result<(), StoreError> {
        match self.store.update_schedule_run(run_id, update.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%run_id, error = %e, "failed to record attempt outcome; retrying");
                self.store.update_schedule_run(run_id, update.clone()).await
            }
        }
    }

    /// One attempt; never fails, the outcome is the update to write
    async fn attempt(&self, schedule: &Schedule) -> ScheduleRunUpdate {
        match background_target(&schedule.method, &schedule.endpoint) {
            Some(target) => self.attempt_background(schedule, &target).await,
            None => self.attempt_request(schedule).await,
        }
    }

    async fn attempt_request(&self, schedule: &Schedule) -> ScheduleRunUpdate {
        let timeout = Duration::from_secs(schedule.timeout_seconds);
        let response = match self
            .api
            .send(
                &schedule.method,
                &schedule.endpoint,
                schedule.payload.as_ref(),
                timeout,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => return failed_with(&e),
        };

        let mut update = if response.is_success() {
            let output = serde_json::from_str::<Value>(&response.body)
                .unwrap_or_else(|_| Value::String(response.body.clone()));
            ScheduleRunUpdate {
                output: Some(output),
                ..ScheduleRunUpdate::finished(ScheduleRunStatus::Success)
            }
        } else if response.body.trim().is_empty() {
            ScheduleRunUpdate::failed(format!("HTTP {}", response.status_code))
        } else {
            ScheduleRunUpdate::failed(response.body.clone())
        };
        update.status_code = Some(response.status_code);
        update.input = schedule.payload.clone();
        update
    }

    /// Submit and poll; both share one deadline
    async fn attempt_background(&self, schedule: &Schedule, target: &RunTarget) -> ScheduleRunUpdate {
        let timeout = Duration::from_secs(schedule.timeout_seconds);
        let deadline = Instant::now() + timeout;
        let submitted = match self
            .api
            .submit_background_run(target, schedule.payload.as_ref(), timeout)
            .await
        {
            Ok(submitted) => submitted,
            Err(e) => return failed_with(&e),
        };
        debug!(
            run_id = %submitted.run_id,
            session_id = %submitted.session_id,
            "background run submitted"
        );

        let mut update = self
            .poll_until_terminal(target, &submitted.run_id, &submitted.session_id, deadline, timeout)
            .await;
        update.status_code = Some(submitted.status_code);
        update.run_id = Some(submitted.run_id);
        update.session_id = Some(submitted.session_id);
        if update.input.is_none() {
            update.input = schedule.payload.clone();
        }
        update
    }

    /// Poll at a fixed interval until a terminal status or the deadline
    async fn poll_until_terminal(
        &self,
        target: &RunTarget,
        run_id: &str,
        session_id: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> ScheduleRunUpdate {
        loop {
            let Ok(polled) =
                tokio::time::timeout_at(deadline, self.api.get_run(target, run_id, session_id))
                    .await
            else {
                break;
            };
            match polled {
                Ok(body) => match RunSnapshot::from_json(&body) {
                    Some(snapshot) if snapshot.status.is_terminal() => {
                        return snapshot_update(snapshot);
                    }
                    Some(snapshot) => trace!(%run_id, status = %snapshot.status, "run still in progress"),
                    None => debug!(%run_id, "unrecognized run status response; polling again"),
                },
                Err(RunApiError::NotFound) => debug!(%run_id, "run not visible yet"),
                Err(e) => warn!(%run_id, error = %e, "run status poll failed; polling again"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until((now + self.config.poll_interval).min(deadline)).await;
            if Instant::now() >= deadline {
                break;
            }
        }

        ScheduleRunUpdate::failed(format!(
            "run {run_id} did not finish within {}s",
            timeout.as_secs()
        ))
    }
}

fn failed_with(error: &RunApiError) -> ScheduleRunUpdate {
    ScheduleRunUpdate {
        status_code: error.status_code(),
        ..ScheduleRunUpdate::failed(error.to_string())
    }
}

fn snapshot_update(snapshot: RunSnapshot) -> ScheduleRunUpdate {
    let output = (snapshot.content.is_some() || snapshot.content_type.is_some()).then(|| {
        json!({
            "content": snapshot.content,
            "content_type": snapshot.content_type,
        })
    });

    let mut update = match snapshot.status {
        RunStatus::Completed => ScheduleRunUpdate::finished(ScheduleRunStatus::Success),
        RunStatus::Paused => ScheduleRunUpdate {
            requirements: snapshot.requirements.clone(),
            ..ScheduleRunUpdate::finished(ScheduleRunStatus::Paused)
        },
        status => {
            let error = snapshot
                .error
                .clone()
                .or_else(|| match &snapshot.content {
                    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| format!("run ended with status {status}"));
            ScheduleRunUpdate::failed(error)
        }
    };
    update.output = output;
    update.input = snapshot.input;
    update
}
