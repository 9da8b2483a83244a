//! Human-in-the-loop approval gate

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use runwarden_schemas::{
    ApprovalRecord, ApprovalStatus, ApprovalType, AuditOutcome, OwnerIds, PauseType, Run,
    RunStatus, SourceType, ToolExecution,
};

use crate::persistence::{RunDatabase, StoreError};

/// Conditions that stop a run from continuing
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// The run needs an approval but none was ever recorded
    #[error("no approval record found for run {run_id}")]
    NoApprovalRecord { run_id: String },

    /// The approval exists but nobody has acted on it yet
    #[error("approval {approval_id} for run {run_id} is still pending")]
    ApprovalPending { run_id: String, approval_id: Uuid },

    /// Reading the approval failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Bridges a run's in-memory pause to a durable approval record
///
/// The gate is stateless; everything it knows lives in the run and in the
/// database. When the database has no approval capability every operation
/// is a no-op.
#[derive(Clone)]
pub struct ApprovalGate {
    db: Arc<dyn RunDatabase>,
}

impl ApprovalGate {
    pub fn new(db: Arc<dyn RunDatabase>) -> Self {
        Self { db }
    }

    /// Record a pending approval for a paused run
    ///
    /// Callers invoke this once per pause; the gate does not deduplicate.
    /// Returns the stored record, or `None` if nothing needed approval, the
    /// store is unsupported, or the write failed (logged).
    #[instrument(skip(self, run, owners), fields(run_id = %run.run_id))]
    pub async fn create_approval_from_pause(
        &self,
        run: &Run,
        owners: &OwnerIds,
    ) -> Option<ApprovalRecord> {
        let gated: Vec<&ToolExecution> = run
            .paused_tools()
            .filter(|tool| tool.requires_approval())
            .collect();
        let first = gated.first()?;

        let Some(store) = self.db.approval_store() else {
            debug!("approval store unsupported; skipping approval record");
            return None;
        };

        let mut tool_names: Vec<&str> = vec![];
        for tool in &gated {
            if !tool_names.contains(&tool.tool_name.as_str()) {
                tool_names.push(&tool.tool_name);
            }
        }

        let mut record = new_record(
            run,
            first,
            owners,
            ApprovalType::Required,
            first.pause_type(),
        );
        record.context = json!({
            "tool_names": tool_names,
            "source_name": record.source_name,
        });
        record.requirements = serde_json::to_value(&run.requirements).unwrap_or_else(|e| {
            warn!(error = %e, "failed to snapshot run requirements");
            Value::Null
        });

        match store.create_approval(&record).await {
            Ok(()) => {
                info!(
                    approval_id = %record.id,
                    pause_type = ?record.pause_type,
                    tools = gated.len(),
                    "approval requested"
                );
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "failed to create approval record");
                None
            }
        }
    }

    /// Refuse to continue past an unresolved approval, else apply its resolution
    ///
    /// A no-op when no tool on the run requires approval. On `approved`,
    /// confirmations are set, user-input values and external results are
    /// copied from the resolution data; on `rejected`, every gated tool is
    /// marked unconfirmed.
    #[instrument(skip(self, run))]
    pub async fn check_and_apply_approval_resolution(
        &self,
        run_id: &str,
        run: &mut Run,
    ) -> Result<(), ApprovalError> {
        // Metadata comes from the first gated tool only
        let Some(first) = run.tools.iter().find(|tool| tool.requires_approval()) else {
            return Ok(());
        };
        let pause_type = first.pause_type();

        let Some(store) = self.db.approval_store() else {
            debug!("approval store unsupported; nothing to check");
            return Ok(());
        };

        let (records, _) = store
            .get_approvals(run_id, Some(ApprovalType::Required), 1)
            .await?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| ApprovalError::NoApprovalRecord {
                run_id: run_id.to_string(),
            })?;

        let approved = match record.status {
            ApprovalStatus::Pending => {
                return Err(ApprovalError::ApprovalPending {
                    run_id: run_id.to_string(),
                    approval_id: record.id,
                })
            }
            ApprovalStatus::Approved => true,
            ApprovalStatus::Rejected => false,
        };

        // The resolution goes to every gated tool, not just the first
        let data = record.resolution_data.as_ref();
        let mut applied = 0;
        for tool in run.tools.iter_mut().filter(|t| t.requires_approval()) {
            apply_resolution(tool, approved, data);
            applied += 1;
        }
        for requirement in &mut run.requirements {
            if requirement.tool_execution.requires_approval() {
                apply_resolution(&mut requirement.tool_execution, approved, data);
            }
        }
        run.requirements
            .retain(|requirement| requirement.tool_execution.is_paused());
        if run.status == RunStatus::Paused && run.requirements.is_empty() {
            run.status = RunStatus::Running;
        }

        info!(
            approval_id = %record.id,
            status = %record.status,
            ?pause_type,
            applied,
            "approval resolution applied"
        );
        Ok(())
    }

    /// Record an already-resolved audit entry for a tool that has run
    ///
    /// Only tools marked `approval_type = audit` are recorded. Never blocks.
    #[instrument(skip(self, run, tool, owners), fields(run_id = %run.run_id, tool = %tool.tool_name))]
    pub async fn create_audit_approval(
        &self,
        run: &Run,
        tool: &ToolExecution,
        owners: &OwnerIds,
        outcome: AuditOutcome,
    ) -> Option<ApprovalRecord> {
        if tool.approval_type != Some(ApprovalType::Audit) {
            return None;
        }
        let Some(store) = self.db.approval_store() else {
            debug!("approval store unsupported; skipping audit record");
            return None;
        };

        let now = Utc::now();
        let mut record = new_record(run, tool, owners, ApprovalType::Audit, tool.pause_type());
        record.status = outcome.into();
        record.context = json!({
            "tool_names": [tool.tool_name],
            "source_name": record.source_name,
        });
        record.resolution_data = tool.result.as_ref().map(|result| json!({ "result": result }));
        record.resolved_at = Some(now);

        match store.create_approval(&record).await {
            Ok(()) => {
                debug!(approval_id = %record.id, status = %record.status, "audit approval recorded");
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "failed to create audit approval record");
                None
            }
        }
    }
}

fn new_record(
    run: &Run,
    tool: &ToolExecution,
    owners: &OwnerIds,
    approval_type: ApprovalType,
    pause_type: PauseType,
) -> ApprovalRecord {
    let (source_type, source_name) = match owners.most_specific() {
        Some((source_type, owner)) => (
            source_type,
            Some(owner.name.clone().unwrap_or_else(|| owner.id.clone())),
        ),
        None => (SourceType::default(), None),
    };
    let now = Utc::now();

    ApprovalRecord {
        id: Uuid::now_v7(),
        run_id: run.run_id.clone(),
        session_id: run.session_id.clone(),
        status: ApprovalStatus::Pending,
        approval_type,
        pause_type,
        tool_name: Some(tool.tool_name.clone()),
        tool_args: Some(tool.tool_args.clone()),
        source_type,
        source_name,
        agent_id: owners.agent.as_ref().map(|o| o.id.clone()),
        team_id: owners.team.as_ref().map(|o| o.id.clone()),
        workflow_id: owners.workflow.as_ref().map(|o| o.id.clone()),
        user_id: owners.user_id.clone(),
        context: Value::Null,
        requirements: Value::Null,
        resolution_data: None,
        resolved_by: None,
        resolved_at: None,
        expires_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn apply_resolution(tool: &mut ToolExecution, approved: bool, data: Option<&Value>) {
    if !approved {
        tool.confirmed = Some(false);
        return;
    }

    if tool.requires_confirmation {
        tool.confirmed = Some(true);
    }

    if tool.requires_user_input {
        // Values live under "values", or the resolution data is the map itself
        let values = data.and_then(|d| d.get("values").or(Some(d)));
        if let Some(values) = values {
            for field in tool.user_input_schema.iter_mut().filter(|f| f.value.is_none()) {
                if let Some(value) = values.get(&field.name) {
                    field.value = Some(value.clone());
                }
            }
        }
    }

    if tool.external_execution_required && tool.result.is_none() {
        if let Some(result) = data.and_then(|d| d.get("result")) {
            tool.result = Some(result.clone());
        }
    }
}
