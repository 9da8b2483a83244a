// Run domain types
//
// A run is one execution attempt of an agent, team or workflow. The model
// loop owns its lifecycle; the approval gate only rewrites tool executions
// while the run is paused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalType, PauseType, SourceType};

/// Run status as reported by the run API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Parse a status string, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RUNNING" | "PENDING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// No further progress happens without a new run (or a resume, for `Paused`)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field a paused tool asks the user to fill in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInputField {
    pub name: String,
    #[serde(default = "default_field_type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

fn default_field_type() -> String {
    "str".to_string()
}

impl UserInputField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: default_field_type(),
            description: None,
            value: None,
        }
    }
}

/// A tool call made by the model, with its human-in-the-loop flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,

    #[serde(default)]
    pub requires_user_input: bool,
    #[serde(default)]
    pub user_input_schema: Vec<UserInputField>,

    #[serde(default)]
    pub external_execution_required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_type: Option<ApprovalType>,
}

impl ToolExecution {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(format!("call_{}", Uuid::now_v7().simple())),
            tool_name: tool_name.into(),
            tool_args: serde_json::Value::Object(Default::default()),
            result: None,
            requires_confirmation: false,
            confirmed: None,
            requires_user_input: false,
            user_input_schema: vec![],
            external_execution_required: false,
            approval_type: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.tool_args = args;
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_user_input(mut self, schema: Vec<UserInputField>) -> Self {
        self.requires_user_input = true;
        self.user_input_schema = schema;
        self
    }

    pub fn with_external_execution(mut self) -> Self {
        self.external_execution_required = true;
        self
    }

    pub fn with_approval_type(mut self, approval_type: ApprovalType) -> Self {
        self.approval_type = Some(approval_type);
        self
    }

    /// Whether this tool call is gated behind a required human approval
    pub fn requires_approval(&self) -> bool {
        self.approval_type == Some(ApprovalType::Required)
    }

    /// Whether every user-input field has a value
    pub fn user_input_complete(&self) -> bool {
        self.user_input_schema.iter().all(|f| f.value.is_some())
    }

    /// Whether the tool call is still waiting on a human or an external executor
    pub fn is_paused(&self) -> bool {
        // A rejected call will not run, whatever else it was waiting on
        if self.confirmed == Some(false) {
            return false;
        }
        (self.requires_confirmation && self.confirmed.is_none())
            || (self.requires_user_input && !self.user_input_complete())
            || (self.external_execution_required && self.result.is_none())
    }

    /// The pause kind, in priority order user input > external execution > confirmation
    pub fn pause_type(&self) -> PauseType {
        if self.requires_user_input {
            PauseType::UserInput
        } else if self.external_execution_required {
            PauseType::ExternalExecution
        } else {
            PauseType::Confirmation
        }
    }
}

/// A paused run's description of what it needs to continue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequirement {
    pub id: Uuid,
    pub pause_type: PauseType,
    pub tool_execution: ToolExecution,
    pub created_at: DateTime<Utc>,
}

impl RunRequirement {
    pub fn for_tool(tool_execution: ToolExecution) -> Self {
        Self {
            id: Uuid::now_v7(),
            pause_type: tool_execution.pause_type(),
            tool_execution,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message exchanged during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl RunMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
        }
    }

    /// Trimmed text content, if there is any
    pub fn text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Identity (and display name) of one owner of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl OwnerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Owners of a run; a workflow step may carry all three
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<OwnerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<OwnerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<OwnerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl OwnerIds {
    pub fn agent(agent: OwnerRef) -> Self {
        Self {
            agent: Some(agent),
            ..Default::default()
        }
    }

    pub fn with_team(mut self, team: OwnerRef) -> Self {
        self.team = Some(team);
        self
    }

    pub fn with_workflow(mut self, workflow: OwnerRef) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The most specific owner present: workflow > team > agent
    pub fn most_specific(&self) -> Option<(SourceType, &OwnerRef)> {
        if let Some(workflow) = &self.workflow {
            return Some((SourceType::Workflow, workflow));
        }
        if let Some(team) = &self.team {
            return Some((SourceType::Team, team));
        }
        self.agent.as_ref().map(|agent| (SourceType::Agent, agent))
    }
}

/// One execution attempt of an agent, team or workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    #[serde(default)]
    pub owner: OwnerIds,
    pub status: RunStatus,
    #[serde(default)]
    pub requirements: Vec<RunRequirement>,
    #[serde(default)]
    pub tools: Vec<ToolExecution>,
    #[serde(default)]
    pub messages: Vec<RunMessage>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            owner: OwnerIds::default(),
            status: RunStatus::Running,
            requirements: vec![],
            tools: vec![],
            messages: vec![],
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: OwnerIds) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_messages(mut self, messages: Vec<RunMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Record tool executions and pause if any of them is waiting on a human
    pub fn with_tools(mut self, tools: Vec<ToolExecution>) -> Self {
        self.requirements = tools
            .iter()
            .filter(|tool| tool.is_paused())
            .cloned()
            .map(RunRequirement::for_tool)
            .collect();
        if !self.requirements.is_empty() {
            self.status = RunStatus::Paused;
        }
        self.tools = tools;
        self
    }

    pub fn is_paused(&self) -> bool {
        self.status == RunStatus::Paused
    }

    /// Paused tool executions, in call order
    pub fn paused_tools(&self) -> impl Iterator<Item = &ToolExecution> {
        self.tools.iter().filter(|tool| tool.is_paused())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(RunStatus::parse("completed"), Some(RunStatus::Completed));
        assert_eq!(RunStatus::parse(" PAUSED "), Some(RunStatus::Paused));
        assert_eq!(RunStatus::parse("exploded"), None);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_pause_type_priority() {
        let tool = ToolExecution::new("deploy")
            .with_confirmation()
            .with_external_execution()
            .with_user_input(vec![UserInputField::new("region")]);
        assert_eq!(tool.pause_type(), PauseType::UserInput);

        let tool = ToolExecution::new("deploy")
            .with_confirmation()
            .with_external_execution();
        assert_eq!(tool.pause_type(), PauseType::ExternalExecution);

        let tool = ToolExecution::new("deploy").with_confirmation();
        assert_eq!(tool.pause_type(), PauseType::Confirmation);
    }

    #[test]
    fn test_tool_stops_being_paused_once_answered() {
        let mut tool = ToolExecution::new("delete_file").with_confirmation();
        assert!(tool.is_paused());
        tool.confirmed = Some(false);
        assert!(!tool.is_paused());

        let mut tool =
            ToolExecution::new("ask").with_user_input(vec![UserInputField::new("answer")]);
        assert!(tool.is_paused());
        tool.user_input_schema[0].value = Some(serde_json::json!("yes"));
        assert!(!tool.is_paused());
    }

    #[test]
    fn test_most_specific_owner() {
        let owners = OwnerIds::agent(OwnerRef::named("a1", "Researcher"))
            .with_team(OwnerRef::named("t1", "Research Team"));
        let (source, owner) = owners.most_specific().unwrap();
        assert_eq!(source, SourceType::Team);
        assert_eq!(owner.id, "t1");

        let owners = owners.with_workflow(OwnerRef::new("w1"));
        assert_eq!(owners.most_specific().unwrap().0, SourceType::Workflow);

        assert!(OwnerIds::default().most_specific().is_none());
    }

    #[test]
    fn test_with_tools_pauses_run() {
        let run = Run::new("run-1", "session-1").with_tools(vec![
            ToolExecution::new("search"),
            ToolExecution::new("send_email").with_confirmation(),
        ]);
        assert!(run.is_paused());
        assert_eq!(run.requirements.len(), 1);
        assert_eq!(run.requirements[0].tool_execution.tool_name, "send_email");
        assert_eq!(run.paused_tools().count(), 1);
    }
}
