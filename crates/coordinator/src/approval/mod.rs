//! Human-in-the-loop approvals
//!
//! A run that pauses on a tool marked `approval_type = required` gets a
//! durable pending [`ApprovalRecord`](runwarden_schemas::ApprovalRecord).
//! An external actor resolves it; the next continuation attempt goes through
//! [`ApprovalGate::check_and_apply_approval_resolution`], which either blocks
//! or copies the resolution onto the run's tool executions.

mod gate;

pub use gate::{ApprovalError, ApprovalGate};
