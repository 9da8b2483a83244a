//! Due-schedule poller
//!
//! Claims due schedules and hands each to the executor, bounded by a
//! semaphore. Shutdown stops claiming, then waits for in-flight executions;
//! anything still running at the deadline is cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::executor::ScheduleExecutor;
use crate::config::duration_millis;
use crate::persistence::{ScheduleStore, StoreError};

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Identity written into `locked_by`
    pub worker_id: String,

    /// Interval between claim attempts
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum schedules executing at once
    pub max_concurrent: usize,

    /// How long shutdown waits for in-flight executions
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("scheduler-{}", Uuid::now_v7()),
            poll_interval: Duration::from_secs(15),
            max_concurrent: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller already running
    #[error("schedule poller is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

#[derive(Clone)]
struct Dispatcher {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<ScheduleExecutor>,
    worker_id: String,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn dispatch(&self) -> Result<usize, PollerError> {
        let available = self.slots.available_permits();
        if available == 0 {
            trace!("all execution slots busy");
            return Ok(0);
        }

        let claimed = self
            .store
            .claim_due_schedules(&self.worker_id, Utc::now(), available)
            .await?;

        let mut started = 0;
        for schedule in claimed {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                // Hand it back untouched so another poll picks it up
                warn!(schedule_id = %schedule.id, "no execution slot; returning schedule");
                if let Err(e) = self
                    .store
                    .release_schedule(schedule.id, schedule.next_run_at)
                    .await
                {
                    error!(schedule_id = %schedule.id, "Failed to return schedule: {}", e);
                }
                continue;
            };

            info!(schedule_id = %schedule.id, name = %schedule.name, "schedule claimed");
            let executor = Arc::clone(&self.executor);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.execute(&schedule, cancel).await {
                    debug!(schedule_id = %schedule.id, error = %e, "execution ended early");
                }
            });
            started += 1;
        }
        Ok(started)
    }
}

/// Claims and executes due schedules in the background
pub struct SchedulePoller {
    config: PollerConfig,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulePoller {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executor: Arc<ScheduleExecutor>,
        config: PollerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            store,
            executor,
            worker_id: config.worker_id.clone(),
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            cancel: CancellationToken::new(),
        };

        Self {
            config,
            dispatcher,
            shutdown_tx,
            shutdown_rx,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Executions currently in flight
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent.max(1) - self.dispatcher.slots.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle.lock().is_some()
    }

    /// Claim due schedules once; returns how many executions started
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn poll_once(&self) -> Result<usize, PollerError> {
        self.dispatcher.dispatch().await
    }

    /// Start the background poll loop
    pub fn start(&self) -> Result<(), PollerError> {
        let mut handle_slot = self.loop_handle.lock();
        if handle_slot.is_some() {
            return Err(PollerError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting schedule poller"
        );

        let dispatcher = self.dispatcher.clone();
        let interval = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        *handle_slot = Some(tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                match dispatcher.dispatch().await {
                    Ok(0) => trace!("no due schedules"),
                    Ok(count) => debug!(count, "started schedule executions"),
                    Err(e) => error!("Schedule poll failed: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("Poll loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("Poll loop exited");
        }));
        Ok(())
    }

    /// Stop claiming and wait for in-flight executions
    ///
    /// Executions still running at the deadline are cancelled; each one
    /// marks its attempt cancelled and releases its schedule.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), PollerError> {
        info!("Initiating schedule poller shutdown");
        let _ = self.shutdown_tx.send(true);

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                debug!("All schedule executions completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Shutdown timeout reached; cancelling executions");
                self.dispatcher.cancel.cancel();
                return Err(PollerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Schedule poller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert!(config.worker_id.starts_with("scheduler-"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_worker_id("w1")
            .with_max_concurrent(0)
            .with_poll_interval(Duration::from_millis(250));
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.max_concurrent, 1);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 250);
    }
}
