// Schedule domain types
//
// A schedule is a recurring trigger against the run API; a schedule run is
// one attempt to fire it. Schedule runs are created before the attempt and
// updated exactly once with its outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recurring trigger definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// HTTP method of the target endpoint (e.g. "POST")
    pub method: String,
    /// Path relative to the run API base URL (e.g. "/agents/researcher/runs")
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub cron_expr: String,
    pub timezone: String,
    /// Wall-clock limit for one attempt
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an enabled schedule with default timeout (1h) and no retries
    pub fn new(
        name: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            method: method.into(),
            endpoint: endpoint.into(),
            payload: None,
            cron_expr: cron_expr.into(),
            timezone: "UTC".to_string(),
            timeout_seconds: 3600,
            max_retries: 0,
            retry_delay_seconds: 60,
            enabled: true,
            next_run_at: Some(now),
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = next_run_at;
        self
    }

    /// Total attempts allowed per firing (initial + retries, at least one)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1).max(1)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Enabled, unlocked and past its fire time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_locked() && self.next_run_at.is_some_and(|at| at <= now)
    }
}

/// Status of one schedule attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Running,
    Success,
    /// The triggered run paused for human input; a legitimate stop, not a failure
    Paused,
    Failed,
    Cancelled,
}

impl ScheduleRunStatus {
    /// Outcomes that stop the retry loop
    pub fn ends_retries(&self) -> bool {
        matches!(self, Self::Success | Self::Paused)
    }
}

impl std::fmt::Display for ScheduleRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One attempt record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    /// 1-based attempt number within one firing
    pub attempt: u32,
    pub triggered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScheduleRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRun {
    /// A fresh attempt in `running` state
    pub fn start(schedule_id: Uuid, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            schedule_id,
            attempt,
            triggered_at: now,
            completed_at: None,
            status: ScheduleRunStatus::Running,
            status_code: None,
            run_id: None,
            session_id: None,
            error: None,
            input: None,
            output: None,
            requirements: None,
            created_at: now,
        }
    }

    /// Merge an update into this snapshot; absent fields are left untouched
    pub fn apply(&mut self, update: &ScheduleRunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(code) = update.status_code {
            self.status_code = Some(code);
        }
        if let Some(run_id) = &update.run_id {
            self.run_id = Some(run_id.clone());
        }
        if let Some(session_id) = &update.session_id {
            self.session_id = Some(session_id.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(input) = &update.input {
            self.input = Some(input.clone());
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(requirements) = &update.requirements {
            self.requirements = Some(requirements.clone());
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// Fields written to a schedule run when its attempt ends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRunUpdate {
    pub status: Option<ScheduleRunStatus>,
    pub status_code: Option<u16>,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub requirements: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduleRunUpdate {
    /// Terminal update with the given status, stamped now
    pub fn finished(status: ScheduleRunStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::finished(ScheduleRunStatus::Failed)
        }
    }
}
