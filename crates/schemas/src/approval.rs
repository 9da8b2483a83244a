// Approval domain types
//
// An approval record is the durable side of a run pause: the coordinator
// writes it, an external actor resolves it, and the gate consumes the
// resolution when the run continues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolution state of an approval record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a tool's approval is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// The run may not continue until a human resolves the record
    Required,
    /// The tool runs; a resolved record is written afterwards for the audit trail
    Audit,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Audit => "audit",
        }
    }
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of human action a paused tool call is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseType {
    #[default]
    Confirmation,
    UserInput,
    ExternalExecution,
}

/// Kind of owner that produced a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Agent,
    Team,
    Workflow,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::Workflow => "workflow",
        }
    }
}

/// Outcome recorded on an audit approval
///
/// Audit records are written after the tool already ran, so they are never
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Approved,
    Rejected,
}

impl From<AuditOutcome> for ApprovalStatus {
    fn from(outcome: AuditOutcome) -> Self {
        match outcome {
            AuditOutcome::Approved => ApprovalStatus::Approved,
            AuditOutcome::Rejected => ApprovalStatus::Rejected,
        }
    }
}

/// Durable record of a pause requiring external action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub run_id: String,
    pub session_id: String,
    pub status: ApprovalStatus,
    pub approval_type: ApprovalType,
    pub pause_type: PauseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Display context (distinct tool names, source name)
    #[serde(default)]
    pub context: serde_json::Value,
    /// Snapshot of the run's pending requirements at pause time
    #[serde(default)]
    pub requirements: serde_json::Value,
    /// Data supplied by the resolver (field values, external results)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_wire_format() {
        assert_eq!(
            serde_json::to_value(PauseType::ExternalExecution).unwrap(),
            "external_execution"
        );
        assert_eq!(serde_json::to_value(ApprovalType::Audit).unwrap(), "audit");
        assert_eq!(
            serde_json::from_value::<ApprovalStatus>("rejected".into()).unwrap(),
            ApprovalStatus::Rejected
        );
    }

    #[test]
    fn test_audit_outcome_is_never_pending() {
        assert_eq!(
            ApprovalStatus::from(AuditOutcome::Approved),
            ApprovalStatus::Approved
        );
        assert_eq!(
            ApprovalStatus::from(AuditOutcome::Rejected),
            ApprovalStatus::Rejected
        );
    }
}
