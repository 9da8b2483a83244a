//! Unattended schedule execution
//!
//! - [`SchedulePoller`] claims due schedules and bounds concurrency
//! - [`ScheduleExecutor`] runs one schedule: retries, background submission,
//!   bounded polling, and the release of its lock via [`ScheduleLease`]
//! - [`RunApiClient`] talks to the HTTP run API
//! - [`NextRunCalculator`] computes the next fire time

mod client;
mod cron;
mod executor;
mod lease;
mod poller;

pub use client::{
    background_form, background_target, EndpointResponse, RunApi, RunApiClient, RunApiError,
    RunSnapshot, RunTarget, SubmittedRun,
};
pub use cron::{CronError, FixedInterval, NextRunCalculator};
pub use executor::{ExecutorConfig, ExecutorError, ScheduleExecutor};
pub use lease::{cancelled_update, ReleaseOutcome, ScheduleLease};
pub use poller::{PollerConfig, PollerError, SchedulePoller};
