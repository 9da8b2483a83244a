//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use runwarden_schemas::{ApprovalRecord, ApprovalType, Schedule, ScheduleRun, ScheduleRunUpdate};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// Schedule run not found
    #[error("schedule run not found: {0}")]
    ScheduleRunNotFound(Uuid),

    /// Approval not found
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),

    /// Record already exists
    #[error("duplicate record: {0}")]
    Duplicate(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence for schedules and their attempt records
///
/// The schedule lock (`locked_by`/`locked_at`) is the only cross-process
/// concurrency boundary: only the holder executes a schedule, and
/// [`release_schedule`](ScheduleStore::release_schedule) clears it.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Insert a new attempt record
    async fn create_schedule_run(&self, run: &ScheduleRun) -> Result<(), StoreError>;

    /// Merge terminal fields into an attempt record
    async fn update_schedule_run(
        &self,
        run_id: Uuid,
        update: ScheduleRunUpdate,
    ) -> Result<(), StoreError>;

    /// Clear the lock and set the next fire time
    async fn release_schedule(
        &self,
        schedule_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Enable or disable a schedule
    async fn update_schedule(&self, schedule_id: Uuid, enabled: bool) -> Result<(), StoreError>;

    /// Atomically lock up to `limit` enabled, unlocked schedules due at `now`
    async fn claim_due_schedules(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError>;
}

/// Persistence for approval records
#[async_trait]
pub trait ApprovalStore: Send + Sync + 'static {
    /// Insert a new approval record
    async fn create_approval(&self, record: &ApprovalRecord) -> Result<(), StoreError>;

    /// Approvals for a run, newest first, with the total count before `limit`
    async fn get_approvals(
        &self,
        run_id: &str,
        approval_type: Option<ApprovalType>,
        limit: usize,
    ) -> Result<(Vec<ApprovalRecord>, usize), StoreError>;
}

/// The database a run is attached to
///
/// Optional capabilities are feature-detected: a store without approval
/// support returns `None` and callers treat that as "unsupported".
pub trait RunDatabase: Send + Sync + 'static {
    /// Approval capability, if this store has one
    fn approval_store(&self) -> Option<&dyn ApprovalStore> {
        None
    }
}
