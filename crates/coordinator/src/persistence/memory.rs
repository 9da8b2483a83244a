//! In-memory implementation of the coordination stores for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use runwarden_schemas::{
    ApprovalRecord, ApprovalStatus, ApprovalType, Schedule, ScheduleRun, ScheduleRunUpdate,
};

use super::store::*;

/// In-memory implementation of [`ScheduleStore`] and [`ApprovalStore`]
///
/// This is primarily for testing and demos. It keeps everything in memory
/// and provides the same semantics a database-backed store must provide,
/// including atomic claiming of due schedules.
///
/// # Example
///
/// ```
/// use runwarden_coordinator::InMemoryCoordinationStore;
///
/// let store = InMemoryCoordinationStore::new();
/// assert_eq!(store.schedule_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    schedule_runs: RwLock<Vec<ScheduleRun>>,
    approvals: RwLock<Vec<ApprovalRecord>>,
    releases: RwLock<HashMap<Uuid, u32>>,
}

impl InMemoryCoordinationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a schedule
    pub fn insert_schedule(&self, schedule: Schedule) {
        self.schedules.write().insert(schedule.id, schedule);
    }

    /// Current state of a schedule
    pub fn schedule(&self, schedule_id: Uuid) -> Option<Schedule> {
        self.schedules.read().get(&schedule_id).cloned()
    }

    /// Get the number of schedules
    pub fn schedule_count(&self) -> usize {
        self.schedules.read().len()
    }

    /// Attempt records for a schedule, in creation order
    pub fn schedule_runs(&self, schedule_id: Uuid) -> Vec<ScheduleRun> {
        self.schedule_runs
            .read()
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect()
    }

    /// How many times a schedule's lock was released
    pub fn release_count(&self, schedule_id: Uuid) -> u32 {
        self.releases
            .read()
            .get(&schedule_id)
            .copied()
            .unwrap_or(0)
    }

    /// Approvals for a run, in creation order
    pub fn approvals_for_run(&self, run_id: &str) -> Vec<ApprovalRecord> {
        self.approvals
            .read()
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Resolve an approval the way an external reviewer would
    pub fn resolve_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        resolution_data: Option<serde_json::Value>,
        resolved_by: impl Into<String>,
    ) -> Result<ApprovalRecord, StoreError> {
        let mut approvals = self.approvals.write();
        let record = approvals
            .iter_mut()
            .find(|a| a.id == approval_id)
            .ok_or(StoreError::ApprovalNotFound(approval_id))?;

        let now = Utc::now();
        record.status = status;
        record.resolution_data = resolution_data;
        record.resolved_by = Some(resolved_by.into());
        record.resolved_at = Some(now);
        record.updated_at = now;
        Ok(record.clone())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.schedules.write().clear();
        self.schedule_runs.write().clear();
        self.approvals.write().clear();
        self.releases.write().clear();
    }
}

#[async_trait]
impl ScheduleStore for InMemoryCoordinationStore {
    async fn create_schedule_run(&self, run: &ScheduleRun) -> Result<(), StoreError> {
        let mut runs = self.schedule_runs.write();
        if runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::Duplicate(run.id));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn update_schedule_run(
        &self,
        run_id: Uuid,
        update: ScheduleRunUpdate,
    ) -> Result<(), StoreError> {
        let mut runs = self.schedule_runs.write();
        let run = runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::ScheduleRunNotFound(run_id))?;
        run.apply(&update);
        Ok(())
    }

    async fn release_schedule(
        &self,
        schedule_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(StoreError::ScheduleNotFound(schedule_id))?;

        schedule.locked_by = None;
        schedule.locked_at = None;
        schedule.next_run_at = next_run_at;
        schedule.updated_at = Utc::now();

        *self.releases.write().entry(schedule_id).or_insert(0) += 1;
        Ok(())
    }

    async fn update_schedule(&self, schedule_id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(StoreError::ScheduleNotFound(schedule_id))?;
        schedule.enabled = enabled;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_due_schedules(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        let mut schedules = self.schedules.write();

        let mut due: Vec<&mut Schedule> = schedules.values_mut().filter(|s| s.is_due(now)).collect();
        due.sort_by_key(|s| s.next_run_at);

        let mut claimed = vec![];
        for schedule in due.into_iter().take(limit) {
            schedule.locked_by = Some(worker_id.to_string());
            schedule.locked_at = Some(now);
            claimed.push(schedule.clone());
        }
        Ok(claimed)
    }
}

#[async_trait]
impl ApprovalStore for InMemoryCoordinationStore {
    async fn create_approval(&self, record: &ApprovalRecord) -> Result<(), StoreError> {
        let mut approvals = self.approvals.write();
        if approvals.iter().any(|a| a.id == record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        approvals.push(record.clone());
        Ok(())
    }

    async fn get_approvals(
        &self,
        run_id: &str,
        approval_type: Option<ApprovalType>,
        limit: usize,
    ) -> Result<(Vec<ApprovalRecord>, usize), StoreError> {
        let approvals = self.approvals.read();
        // Insertion order breaks ties between records created in the same instant
        let mut matching: Vec<(usize, &ApprovalRecord)> = approvals
            .iter()
            .enumerate()
            .filter(|(_, a)| a.run_id == run_id)
            .filter(|(_, a)| approval_type.map_or(true, |t| a.approval_type == t))
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));

        let total = matching.len();
        let page = matching
            .into_iter()
            .take(limit)
            .map(|(_, a)| a.clone())
            .collect();
        Ok((page, total))
    }
}

impl RunDatabase for InMemoryCoordinationStore {
    fn approval_store(&self) -> Option<&dyn ApprovalStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwarden_schemas::ScheduleRunStatus;

    fn due_schedule(name: &str) -> Schedule {
        Schedule::new(name, "POST", "/agents/a/runs", "* * * * *")
            .with_next_run_at(Some(Utc::now() - chrono::Duration::seconds(1)))
    }

    #[tokio::test]
    async fn test_claim_locks_due_schedules_once() {
        let store = InMemoryCoordinationStore::new();
        let schedule = due_schedule("a");
        let id = schedule.id;
        store.insert_schedule(schedule);

        let claimed = store
            .claim_due_schedules("worker-1", Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-1"));

        // Already locked - a second worker gets nothing
        let claimed = store
            .claim_due_schedules("worker-2", Utc::now(), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        store.release_schedule(id, None).await.unwrap();
        let schedule = store.schedule(id).unwrap();
        assert!(schedule.locked_by.is_none());
        assert_eq!(store.release_count(id), 1);
    }

    #[tokio::test]
    async fn test_claim_skips_disabled_and_future() {
        let store = InMemoryCoordinationStore::new();
        let mut disabled = due_schedule("disabled");
        disabled.enabled = false;
        store.insert_schedule(disabled);
        store.insert_schedule(
            due_schedule("later").with_next_run_at(Some(Utc::now() + chrono::Duration::hours(1))),
        );

        let claimed = store
            .claim_due_schedules("worker-1", Utc::now(), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_run_update() {
        let store = InMemoryCoordinationStore::new();
        let schedule_id = Uuid::now_v7();
        let run = ScheduleRun::start(schedule_id, 1);
        store.create_schedule_run(&run).await.unwrap();

        store
            .update_schedule_run(run.id, ScheduleRunUpdate::failed("boom"))
            .await
            .unwrap();

        let runs = store.schedule_runs(schedule_id);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ScheduleRunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("boom"));

        let result = store
            .update_schedule_run(Uuid::now_v7(), ScheduleRunUpdate::default())
            .await;
        assert!(matches!(result, Err(StoreError::ScheduleRunNotFound(_))));
    }
}
