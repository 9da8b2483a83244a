//! End-to-end approval flow: pause, block, resolve, continue

use std::sync::Arc;

use serde_json::json;

use runwarden_coordinator::{ApprovalError, ApprovalGate, InMemoryCoordinationStore};
use runwarden_schemas::{
    ApprovalStatus, ApprovalType, AuditOutcome, OwnerIds, OwnerRef, PauseType, Run, RunStatus,
    SourceType, ToolExecution, UserInputField,
};

fn team_owners() -> OwnerIds {
    OwnerIds::agent(OwnerRef::named("agent-1", "Deployer"))
        .with_team(OwnerRef::named("team-1", "Release Team"))
        .with_user("user-42")
}

fn deploy_run() -> Run {
    Run::new("run-1", "session-1").with_tools(vec![
        ToolExecution::new("choose_region")
            .with_user_input(vec![UserInputField::new("region")])
            .with_approval_type(ApprovalType::Required),
        ToolExecution::new("deploy")
            .with_args(json!({"service": "api"}))
            .with_confirmation()
            .with_approval_type(ApprovalType::Required),
        ToolExecution::new("notify_channel")
            .with_confirmation()
            .with_approval_type(ApprovalType::Audit),
    ])
}

#[test_log::test(tokio::test)]
async fn test_pause_block_resolve_continue() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let gate = ApprovalGate::new(store.clone());
    let owners = team_owners();
    let mut run = deploy_run();
    assert_eq!(run.status, RunStatus::Paused);

    let record = gate
        .create_approval_from_pause(&run, &owners)
        .await
        .unwrap();
    assert_eq!(record.pause_type, PauseType::UserInput);
    assert_eq!(record.source_type, SourceType::Team);
    assert_eq!(record.source_name.as_deref(), Some("Release Team"));
    assert_eq!(record.team_id.as_deref(), Some("team-1"));
    assert_eq!(record.user_id.as_deref(), Some("user-42"));
    assert_eq!(
        record.context["tool_names"],
        json!(["choose_region", "deploy"])
    );

    // Still pending: continuing is refused and nothing changes
    let err = gate
        .check_and_apply_approval_resolution("run-1", &mut run)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::ApprovalPending { approval_id, .. } if approval_id == record.id));
    assert!(run.is_paused());

    let resolved = store
        .resolve_approval(
            record.id,
            ApprovalStatus::Approved,
            Some(json!({"region": "eu-west-1"})),
            "ops@example.com",
        )
        .unwrap();
    assert!(resolved.is_resolved());

    gate.check_and_apply_approval_resolution("run-1", &mut run)
        .await
        .unwrap();
    assert_eq!(
        run.tools[0].user_input_schema[0].value,
        Some(json!("eu-west-1"))
    );
    assert_eq!(run.tools[1].confirmed, Some(true));
    // The audit tool is not touched by the gate
    assert!(run.tools[2].confirmed.is_none());

    // The audit tool is recorded after it ran, already resolved
    let audit_tool = run.tools[2].clone();
    let audit = gate
        .create_audit_approval(&run, &audit_tool, &owners, AuditOutcome::Rejected)
        .await
        .unwrap();
    assert_eq!(audit.status, ApprovalStatus::Rejected);

    let records = store.approvals_for_run("run-1");
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|r| r.is_pending()).count(), 0);
}

#[tokio::test]
async fn test_latest_required_approval_wins() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let gate = ApprovalGate::new(store.clone());
    let owners = OwnerIds::agent(OwnerRef::new("agent-1"));

    let paused = Run::new("run-2", "session-2").with_tools(vec![ToolExecution::new("rm")
        .with_confirmation()
        .with_approval_type(ApprovalType::Required)]);

    // First pause was rejected, then the run paused again
    let first = gate
        .create_approval_from_pause(&paused, &owners)
        .await
        .unwrap();
    store
        .resolve_approval(first.id, ApprovalStatus::Rejected, None, "reviewer")
        .unwrap();
    let second = gate
        .create_approval_from_pause(&paused, &owners)
        .await
        .unwrap();

    let mut run = paused.clone();
    let err = gate
        .check_and_apply_approval_resolution("run-2", &mut run)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::ApprovalPending { approval_id, .. } if approval_id == second.id));

    store
        .resolve_approval(second.id, ApprovalStatus::Approved, None, "reviewer")
        .unwrap();
    gate.check_and_apply_approval_resolution("run-2", &mut run)
        .await
        .unwrap();
    assert_eq!(run.tools[0].confirmed, Some(true));
    assert_eq!(run.status, RunStatus::Running);
}
