//! Persistence layer for run coordination
//!
//! This module provides:
//! - [`ScheduleStore`] for schedules, their locks and attempt records
//! - [`ApprovalStore`] for durable approval records
//! - [`RunDatabase`] for feature-detecting optional store capabilities
//! - [`InMemoryCoordinationStore`] for testing

mod memory;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use store::{ApprovalStore, RunDatabase, ScheduleStore, StoreError};
