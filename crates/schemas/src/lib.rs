// Runwarden Schemas
//
// Decision: This crate is the source of truth for records shared between the
// coordinator, its persistence collaborators and the run API
// Decision: Minimal dependencies - only serde, uuid, chrono
// Decision: No runtime logic - only type definitions, small predicates and serialization

pub mod approval;
pub mod run;
pub mod schedule;
pub mod side_effect;

// Approval types
pub use approval::{
    ApprovalRecord, ApprovalStatus, ApprovalType, AuditOutcome, PauseType, SourceType,
};

// Run types
pub use run::{
    MessageRole, OwnerIds, OwnerRef, Run, RunMessage, RunRequirement, RunStatus, ToolExecution,
    UserInputField,
};

// Schedule types
pub use schedule::{Schedule, ScheduleRun, ScheduleRunStatus, ScheduleRunUpdate};

// Side effect types
pub use side_effect::{KnowledgeEntry, SideEffectKind, SideEffectMode};
