// Background side effects of a turn
//
// Memory write-back, learning extraction and cultural-knowledge extraction run
// as best-effort jobs that never gate the user-facing response.

mod backend;
mod manager;

pub use backend::{
    entry_owner, stable_entry_id, BackendError, InMemoryKnowledgeStore, KnowledgeBackend,
    SlotWrite, UpsertOutcome,
};
pub use manager::{SideEffectConfig, SideEffectContext, SideEffectError, SideEffectManager};
