//! # Runwarden Coordinator
//!
//! The asynchronous coordination layer around a run of an agent, team or
//! workflow.
//!
//! ## Features
//!
//! - **Background side effects**: memory write-back, learning extraction and
//!   cultural-knowledge extraction run as best-effort jobs, at most one live
//!   job per run and kind, on cooperative tasks or a bounded thread pool
//! - **Approval gate**: a paused run gets a durable approval record, and
//!   continuation is refused until an external actor resolves it
//! - **Schedule executor**: unattended runs with retries, background
//!   submission, bounded polling and a lock that is always released
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐   ┌──────────────────────┐
//! │  SideEffectManager   │   │     ApprovalGate     │   │    SchedulePoller    │
//! │ (one slot/run/kind)  │   │ (pause -> record ->  │   │ (claims due, bounds  │
//! │                      │   │  resolution)         │   │  concurrency)        │
//! └──────────┬───────────┘   └──────────┬───────────┘   └──────────┬───────────┘
//!            │                          │                          ▼
//!            ▼                          │               ┌──────────────────────┐
//! ┌──────────────────────┐              │               │   ScheduleExecutor   │
//! │ TaskSpawner / Handle │              │               │ (retries, polling,   │
//! │ (cooperative|thread) │              │               │  ScheduleLease)      │
//! └──────────┬───────────┘              │               └──────────┬───────────┘
//!            ▼                          ▼                          ▼
//!   KnowledgeBackend           RunDatabase/ApprovalStore    ScheduleStore + RunApi
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use runwarden_coordinator::prelude::*;
//!
//! let store = Arc::new(InMemoryCoordinationStore::new());
//! let config = CoordinatorConfig::from_env()?;
//! let executor = Arc::new(ScheduleExecutor::new(
//!     store.clone(),
//!     Arc::new(config.api_client()),
//!     Arc::new(FixedInterval::new(Duration::from_secs(3600))),
//!     config.executor_config(),
//! ));
//! let poller = SchedulePoller::new(store, executor, config.poller_config());
//! poller.start()?;
//! ```

pub mod approval;
pub mod config;
pub mod persistence;
pub mod schedule;
pub mod side_effects;
pub mod task;

/// Prelude for common imports
pub mod prelude {
    pub use crate::approval::{ApprovalError, ApprovalGate};
    pub use crate::config::{ConfigError, CoordinatorConfig};
    pub use crate::persistence::{
        ApprovalStore, InMemoryCoordinationStore, RunDatabase, ScheduleStore, StoreError,
    };
    pub use crate::schedule::{
        ExecutorConfig, ExecutorError, FixedInterval, NextRunCalculator, PollerConfig,
        RunApi, RunApiClient, ScheduleExecutor, SchedulePoller,
    };
    pub use crate::side_effects::{
        InMemoryKnowledgeStore, KnowledgeBackend, SideEffectConfig, SideEffectContext,
        SideEffectManager,
    };
    pub use crate::task::{CancellableTask, ExecutionBackend, TaskHandle, TaskSpawner};
    pub use runwarden_schemas::*;
}

// Re-export key types at crate root
pub use approval::{ApprovalError, ApprovalGate};
pub use config::{ConfigError, CoordinatorConfig};
pub use persistence::{
    ApprovalStore, InMemoryCoordinationStore, RunDatabase, ScheduleStore, StoreError,
};
pub use schedule::{
    CronError, ExecutorConfig, ExecutorError, FixedInterval, NextRunCalculator, PollerConfig,
    PollerError, RunApi, RunApiClient, RunApiError, ScheduleExecutor, ScheduleLease,
    SchedulePoller,
};
pub use side_effects::{
    BackendError, InMemoryKnowledgeStore, KnowledgeBackend, SideEffectConfig, SideEffectContext,
    SideEffectError, SideEffectManager, SlotWrite, UpsertOutcome,
};
pub use task::{
    AsyncTaskHandle, CancellableTask, ExecutionBackend, TaskError, TaskHandle, TaskOutcome,
    TaskSpawner, ThreadTaskHandle,
};
