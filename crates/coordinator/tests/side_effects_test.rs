//! Supersede semantics of background side effects on both backends

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use runwarden_coordinator::side_effects::{
    BackendError, InMemoryKnowledgeStore, KnowledgeBackend, SideEffectConfig, SideEffectContext,
    SideEffectManager, SlotWrite, UpsertOutcome,
};
use runwarden_coordinator::task::ExecutionBackend;
use runwarden_schemas::{
    KnowledgeEntry, OwnerIds, OwnerRef, Run, RunMessage, SideEffectKind, SideEffectMode,
};

/// Backend whose first memory extraction (or first upsert) blocks until released
#[derive(Default)]
struct GatedBackend {
    store: InMemoryKnowledgeStore,
    calls: AtomicUsize,
    finished: AtomicUsize,
    upserts: AtomicUsize,
    upserts_finished: AtomicUsize,
    entered: Notify,
    release: Notify,
    fail: AtomicBool,
    gate_upsert: bool,
}

impl GatedBackend {
    fn gating_upserts() -> Self {
        Self {
            gate_upsert: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl KnowledgeBackend for GatedBackend {
    async fn create_user_memories(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && !self.gate_upsert {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(BackendError::Extraction("model unavailable".into()))
        } else {
            self.store
                .create_user_memories(messages, user_id, agent_id)
                .await
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn extract_learnings(
        &self,
        messages: &[RunMessage],
        user_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        self.store.extract_learnings(messages, user_id, agent_id).await
    }

    async fn create_cultural_knowledge(
        &self,
        messages: &[RunMessage],
        agent_id: Option<&str>,
    ) -> Result<Vec<KnowledgeEntry>, BackendError> {
        self.store.create_cultural_knowledge(messages, agent_id).await
    }

    async fn upsert_entries(
        &self,
        slot: &SlotWrite,
        entries: Vec<KnowledgeEntry>,
    ) -> Result<UpsertOutcome, BackendError> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) == 0 && self.gate_upsert {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let outcome = self.store.upsert_entries(slot, entries).await;
        self.upserts_finished.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

fn memory_only(backend: ExecutionBackend) -> SideEffectConfig {
    SideEffectConfig::default()
        .with_memory(SideEffectMode::Automatic)
        .with_backend(backend)
}

fn turn(text: &str) -> SideEffectContext {
    SideEffectContext::new("run-1", vec![RunMessage::user(text)]).with_user("user-1")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Ids written when only the latest input is processed
async fn single_start_ids(text: &str) -> Vec<String> {
    let store = Arc::new(InMemoryKnowledgeStore::new());
    let manager = SideEffectManager::new(store.clone(), memory_only(ExecutionBackend::Cooperative));
    manager.trigger(&turn(text));
    manager.wait_for_run("run-1", Duration::from_secs(5)).await;
    store
        .entries(SideEffectKind::Memory)
        .into_iter()
        .map(|e| e.id)
        .collect()
}

async fn assert_superseded_result_is_discarded(backend_kind: ExecutionBackend) {
    let backend = Arc::new(GatedBackend::default());
    let manager = SideEffectManager::new(backend.clone(), memory_only(backend_kind));

    assert_eq!(manager.trigger(&turn("I live in Paris")), 1);
    backend.entered.notified().await;

    // Supersede while the first job is stuck in extraction
    assert_eq!(manager.trigger(&turn("I moved to Berlin")), 1);
    assert_eq!(manager.active_count("run-1"), 1);

    backend.release.notify_one();
    assert_eq!(manager.wait_for_run("run-1", Duration::from_secs(5)).await, 1);

    if matches!(backend_kind, ExecutionBackend::WorkerThreads { .. }) {
        // The superseded job was not preempted; let it finish its extraction
        eventually(|| backend.finished.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let memories = backend.store.entries(SideEffectKind::Memory);
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content, "I moved to Berlin");
    assert_eq!(backend.store.upsert_count(), 1);

    let ids: Vec<String> = memories.into_iter().map(|e| e.id).collect();
    assert_eq!(ids, single_start_ids("I moved to Berlin").await);
}

#[test_log::test(tokio::test)]
async fn test_cooperative_supersede_discards_previous() {
    assert_superseded_result_is_discarded(ExecutionBackend::Cooperative).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_worker_thread_supersede_discards_previous() {
    assert_superseded_result_is_discarded(ExecutionBackend::WorkerThreads { max_threads: 2 }).await;
}

/// The first job is already inside its write when it is superseded
async fn assert_late_write_is_not_applied(backend_kind: ExecutionBackend) {
    let backend = Arc::new(GatedBackend::gating_upserts());
    let manager = SideEffectManager::new(backend.clone(), memory_only(backend_kind));

    assert_eq!(manager.trigger(&turn("I live in Paris")), 1);
    backend.entered.notified().await;

    assert_eq!(manager.trigger(&turn("I moved to Berlin")), 1);
    assert_eq!(manager.wait_for_run("run-1", Duration::from_secs(5)).await, 1);

    backend.release.notify_one();
    if matches!(backend_kind, ExecutionBackend::WorkerThreads { .. }) {
        eventually(|| backend.upserts_finished.load(Ordering::SeqCst) == 2).await;
    }

    let memories = backend.store.entries(SideEffectKind::Memory);
    let contents: Vec<&str> = memories.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["I moved to Berlin"]);
    assert_eq!(backend.store.upsert_count(), 1);

    let ids: Vec<String> = memories.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, single_start_ids("I moved to Berlin").await);
}

#[tokio::test]
async fn test_cooperative_late_write_is_not_applied() {
    assert_late_write_is_not_applied(ExecutionBackend::Cooperative).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_worker_thread_late_write_is_not_applied() {
    assert_late_write_is_not_applied(ExecutionBackend::WorkerThreads { max_threads: 2 }).await;
}

#[tokio::test]
async fn test_backend_failure_never_escapes() {
    let backend = Arc::new(GatedBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    backend.release.notify_one();
    let manager = SideEffectManager::new(backend.clone(), memory_only(ExecutionBackend::Cooperative));

    assert_eq!(manager.trigger(&turn("remember this")), 1);
    manager.wait_for_run("run-1", Duration::from_secs(5)).await;

    assert!(backend.store.is_empty());
    assert_eq!(manager.active_count("run-1"), 0);
}

#[tokio::test]
async fn test_run_context_and_cancel() {
    let backend = Arc::new(GatedBackend::default());
    let manager = SideEffectManager::new(
        backend.clone(),
        SideEffectConfig::automatic().with_culture(SideEffectMode::Agentic),
    );

    let run = Run::new("run-7", "session-7")
        .with_owner(OwnerIds::agent(OwnerRef::new("agent-1")).with_user("user-1"))
        .with_messages(vec![
            RunMessage::user("Always answer in French"),
            RunMessage::assistant("D'accord"),
        ]);
    let ctx = SideEffectContext::from(&run);
    assert_eq!(ctx.agent_id.as_deref(), Some("agent-1"));

    // Memory blocks in the gate, learning completes, culture is agentic
    assert_eq!(manager.trigger(&ctx), 2);
    backend.entered.notified().await;
    eventually(|| backend.store.entries(SideEffectKind::Learning).len() == 2).await;
    eventually(|| manager.active_count("run-7") == 1).await;

    assert_eq!(manager.cancel_run("run-7"), 1);
    assert_eq!(manager.active_count("run-7"), 0);
    backend.release.notify_one();

    assert_eq!(manager.shutdown(Duration::from_secs(1)).await, 0);
    assert!(backend.store.entries(SideEffectKind::Memory).is_empty());
}
