//! Knowledge backend contract
//!
//! The memory, learning and culture subsystems are external collaborators.
//! Each is reached in two steps: an extraction call that computes the entries
//! to write, and an upsert into the (run, kind) slot that produced them. The
//! upsert is a compare-and-set on the slot revision, so a superseded job that
//! is already past its cancellation check still cannot overwrite a newer
//! result.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use runwarden_schemas::{KnowledgeEntry, RunMessage, SideEffectKind};

/// Errors raised by a knowledge backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Extraction (e.g. the model call that summarizes memories) failed
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Writing entries failed
    #[error("upsert failed: {0}")]
    Upsert(String),
}

/// One job's write into its (run, kind) slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotWrite {
    pub run_id: String,
    pub kind: SideEffectKind,
    /// Later jobs for the same slot carry higher revisions
    pub revision: u64,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The slot now holds exactly these entries
    Written(usize),
    /// A newer revision already wrote the slot; nothing changed
    Stale,
}

/// Memory, learning and cultural-knowledge subsystems
#[async_trait]
pub trait KnowledgeBackend: Send + Sync + 'static {
    /// Derive user memories from the user's messages
    async fn create_user_memories(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError>;

    /// Derive learnings from the conversation
    async fn extract_learnings(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError>;

    /// Derive cultural knowledge from the conversation
    async fn create_cultural_knowledge(
        &self,
        messages: &[RunMessage],
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError>;

    /// Replace the slot's entries, unless a higher revision already wrote it
    ///
    /// The revision check and the write must be atomic. Writing the same
    /// revision twice is an idempotent overwrite.
    async fn upsert_entries(
        &self,
        slot: &SlotWrite,
        entries: Vec<KnowledgeEntry>,
    ) -> Result<UpsertOutcome, BackendError>;
}

/// Owner an entry belongs to: the user for memories and learnings, the agent
/// for culture
pub fn entry_owner<'a>(
    kind: SideEffectKind,
    user_id: Option<&'a str>,
    agent_id: Option<&'a str>,
) -> Option<&'a str> {
    match kind {
        SideEffectKind::Memory | SideEffectKind::Learning => user_id,
        SideEffectKind::Culture => agent_id,
    }
}

/// Stable key for the `position`-th entry of a slot
///
/// Independent of content, so a rewrite of the same slot lands on the same
/// keys.
pub fn stable_entry_id(
    kind: SideEffectKind,
    owner: Option<&str>,
    run_id: &str,
    position: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(owner.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(run_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(position.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

type SlotKey = (String, SideEffectKind);

#[derive(Default)]
struct KnowledgeState {
    entries: BTreeMap<String, KnowledgeEntry>,
    /// Latest revision per slot and the ids it wrote
    slots: HashMap<SlotKey, (u64, Vec<String>)>,
}

/// In-memory knowledge backend for tests and demos
///
/// Extraction turns every non-empty message into one unkeyed entry; the
/// manager assigns ids before the upsert.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    state: RwLock<KnowledgeState>,
    upserts: AtomicUsize,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of one kind, ordered by id
    pub fn entries(&self, kind: SideEffectKind) -> Vec<KnowledgeEntry> {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Total number of stored entries
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Number of upserts that were applied
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn extract(
        kind: SideEffectKind,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Vec<KnowledgeEntry> {
        messages
            .iter()
            .filter_map(RunMessage::text)
            .map(|text| KnowledgeEntry {
                id: String::new(),
                kind,
                content: text.to_string(),
                user_id: user_id.map(str::to_string),
                agent_id: agent_id.map(str::to_string),
                source_run_id: None,
                updated_at: Utc::now(),
            })
            .collect()
    }
}

#[async_trait]
impl KnowledgeBackend for InMemoryKnowledgeStore {
    async fn create_user_memories(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        Ok(Self::extract(
            SideEffectKind::Memory,
            messages,
            user_id,
            agent_id,
        ))
    }

    async fn extract_learnings(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        Ok(Self::extract(
            SideEffectKind::Learning,
            messages,
            user_id,
            agent_id,
        ))
    }

    async fn create_cultural_knowledge(
        &self,
        messages: &[RunMessage],
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        Ok(Self::extract(
            SideEffectKind::Culture,
            messages,
            None,
            agent_id,
        ))
    }

    async fn upsert_entries(
        &self,
        slot: &SlotWrite,
        entries: Vec<KnowledgeEntry>,
    ) -> Result<UpsertOutcome, BackendError> {
        if let Some(entry) = entries.iter().find(|e| e.id.is_empty()) {
            return Err(BackendError::Upsert(format!(
                "entry without id: {}",
                entry.content
            )));
        }

        let mut state = self.state.write();
        let key = (slot.run_id.clone(), slot.kind);
        if let Some((revision, _)) = state.slots.get(&key) {
            if *revision > slot.revision {
                debug!(
                    run_id = %slot.run_id,
                    kind = %slot.kind,
                    revision = slot.revision,
                    current = *revision,
                    "stale upsert rejected"
                );
                return Ok(UpsertOutcome::Stale);
            }
        }

        if let Some((_, previous)) = state.slots.remove(&key) {
            for id in previous {
                state.entries.remove(&id);
            }
        }
        let count = entries.len();
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        for entry in entries {
            state.entries.insert(entry.id.clone(), entry);
        }
        state.slots.insert(key, (slot.revision, ids));
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(UpsertOutcome::Written(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(revision: u64) -> SlotWrite {
        SlotWrite {
            run_id: "run-1".to_string(),
            kind: SideEffectKind::Memory,
            revision,
        }
    }

    fn keyed(mut entries: Vec<KnowledgeEntry>, run_id: &str) -> Vec<KnowledgeEntry> {
        for (position, entry) in entries.iter_mut().enumerate() {
            entry.id = stable_entry_id(entry.kind, entry.user_id.as_deref(), run_id, position);
        }
        entries
    }

    #[test]
    fn test_stable_id_ignores_content() {
        let a = stable_entry_id(SideEffectKind::Memory, Some("u1"), "run-1", 0);
        let b = stable_entry_id(SideEffectKind::Memory, Some("u1"), "run-1", 0);
        let c = stable_entry_id(SideEffectKind::Learning, Some("u1"), "run-1", 0);
        let d = stable_entry_id(SideEffectKind::Memory, Some("u1"), "run-1", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryKnowledgeStore::new();
        let messages = vec![RunMessage::user("I prefer metric units")];

        for _ in 0..2 {
            let entries = store
                .create_user_memories(&messages, Some("u1"), None)
                .await
                .unwrap();
            let outcome = store
                .upsert_entries(&slot(1), keyed(entries, "run-1"))
                .await
                .unwrap();
            assert_eq!(outcome, UpsertOutcome::Written(1));
        }

        assert_eq!(store.upsert_count(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.entries(SideEffectKind::Memory)[0].content,
            "I prefer metric units"
        );
    }

    #[tokio::test]
    async fn test_lower_revision_never_overwrites() {
        let store = InMemoryKnowledgeStore::new();
        let newer = store
            .create_user_memories(&[RunMessage::user("I moved to Berlin")], Some("u1"), None)
            .await
            .unwrap();
        let older = store
            .create_user_memories(
                &[RunMessage::user("I live in Paris"), RunMessage::user("I like trains")],
                Some("u1"),
                None,
            )
            .await
            .unwrap();

        store
            .upsert_entries(&slot(2), keyed(newer, "run-1"))
            .await
            .unwrap();
        let outcome = store
            .upsert_entries(&slot(1), keyed(older, "run-1"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Stale);
        let contents: Vec<String> = store
            .entries(SideEffectKind::Memory)
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["I moved to Berlin"]);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_whole_slot() {
        let store = InMemoryKnowledgeStore::new();
        let two = store
            .create_user_memories(
                &[RunMessage::user("a"), RunMessage::user("b")],
                Some("u1"),
                None,
            )
            .await
            .unwrap();
        let one = store
            .create_user_memories(&[RunMessage::user("c")], Some("u1"), None)
            .await
            .unwrap();

        store.upsert_entries(&slot(1), keyed(two, "run-1")).await.unwrap();
        store.upsert_entries(&slot(2), keyed(one, "run-1")).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.entries(SideEffectKind::Memory)[0].content, "c");
    }

    #[tokio::test]
    async fn test_unkeyed_entries_are_refused() {
        let store = InMemoryKnowledgeStore::new();
        let entries = store
            .create_user_memories(&[RunMessage::user("x")], Some("u1"), None)
            .await
            .unwrap();
        let result = store.upsert_entries(&slot(1), entries).await;
        assert!(matches!(result, Err(BackendError::Upsert(_))));
        assert!(store.is_empty());
    }
}
