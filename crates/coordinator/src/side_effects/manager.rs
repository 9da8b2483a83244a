//! Background side-effect manager
//!
//! Owns at most one live job per (run, kind). Starting a new job for a slot
//! cancels the previous one first; a superseded job never writes its result.
//! Nothing here fails the run: every error is logged where it happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use runwarden_schemas::{MessageRole, Run, RunMessage, SideEffectKind, SideEffectMode};

use super::backend::{
    entry_owner, stable_entry_id, BackendError, KnowledgeBackend, SlotWrite, UpsertOutcome,
};
use crate::task::{ExecutionBackend, TaskError, TaskHandle, TaskOutcome, TaskSpawner};

/// Failures inside a side-effect job or while waiting on one
///
/// These are logged, never returned from the manager's public surface.
#[derive(Debug, thiserror::Error)]
pub enum SideEffectError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Which subsystems run automatically, and on which backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectConfig {
    #[serde(default)]
    pub memory: SideEffectMode,
    #[serde(default)]
    pub learning: SideEffectMode,
    #[serde(default)]
    pub culture: SideEffectMode,
    #[serde(default)]
    pub backend: ExecutionBackend,
}

impl SideEffectConfig {
    /// All three subsystems in automatic mode on the cooperative backend
    pub fn automatic() -> Self {
        Self {
            memory: SideEffectMode::Automatic,
            learning: SideEffectMode::Automatic,
            culture: SideEffectMode::Automatic,
            backend: ExecutionBackend::Cooperative,
        }
    }

    pub fn with_memory(mut self, mode: SideEffectMode) -> Self {
        self.memory = mode;
        self
    }

    pub fn with_learning(mut self, mode: SideEffectMode) -> Self {
        self.learning = mode;
        self
    }

    pub fn with_culture(mut self, mode: SideEffectMode) -> Self {
        self.culture = mode;
        self
    }

    pub fn with_backend(mut self, backend: ExecutionBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn mode(&self, kind: SideEffectKind) -> SideEffectMode {
        match kind {
            SideEffectKind::Memory => self.memory,
            SideEffectKind::Learning => self.learning,
            SideEffectKind::Culture => self.culture,
        }
    }
}

/// What a side-effect job needs from the run that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SideEffectContext {
    pub run_id: String,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub messages: Vec<RunMessage>,
}

impl SideEffectContext {
    pub fn new(run_id: impl Into<String>, messages: Vec<RunMessage>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: None,
            agent_id: None,
            messages,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Messages a kind consumes: memory reads user messages, the others read
    /// the whole conversation. Messages without text are dropped.
    pub fn input_for(&self, kind: SideEffectKind) -> Vec<RunMessage> {
        self.messages
            .iter()
            .filter(|m| kind != SideEffectKind::Memory || m.role == MessageRole::User)
            .filter(|m| m.text().is_some())
            .cloned()
            .collect()
    }
}

impl From<&Run> for SideEffectContext {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            user_id: run.owner.user_id.clone(),
            agent_id: run.owner.agent.as_ref().map(|a| a.id.clone()),
            messages: run.messages.clone(),
        }
    }
}

type SlotKey = (String, SideEffectKind);

/// Fires memory, learning and culture jobs after a turn
pub struct SideEffectManager {
    backend: Arc<dyn KnowledgeBackend>,
    config: SideEffectConfig,
    spawner: TaskSpawner,
    slots: Mutex<HashMap<SlotKey, TaskHandle>>,
    revisions: AtomicU64,
}

impl SideEffectManager {
    pub fn new(backend: Arc<dyn KnowledgeBackend>, config: SideEffectConfig) -> Self {
        Self {
            backend,
            spawner: TaskSpawner::new(config.backend),
            config,
            slots: Mutex::new(HashMap::new()),
            revisions: AtomicU64::new(0),
        }
    }

    /// Spawn jobs onto `runtime`, so `start` and `trigger` work from threads
    /// outside it
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.spawner = self.spawner.with_runtime(runtime);
        self
    }

    pub fn config(&self) -> &SideEffectConfig {
        &self.config
    }

    /// Start a job for `kind`, superseding `previous`
    ///
    /// Returns `None` when the kind is not in automatic mode, there is no
    /// text to process, or no runtime is available. A live `previous` handle
    /// is cancelled in every case.
    pub fn start(
        &self,
        kind: SideEffectKind,
        ctx: &SideEffectContext,
        previous: Option<TaskHandle>,
    ) -> Option<TaskHandle> {
        if let Some(previous) = previous {
            if !previous.is_done() {
                debug!(
                    run_id = %ctx.run_id,
                    %kind,
                    task_id = %previous.id(),
                    "superseding unfinished side-effect task"
                );
                previous.cancel();
            }
        }

        if !self.config.mode(kind).runs_in_background() {
            return None;
        }

        let messages = ctx.input_for(kind);
        if messages.is_empty() {
            debug!(run_id = %ctx.run_id, %kind, "no content for side effect");
            return None;
        }

        let backend = Arc::clone(&self.backend);
        let job_ctx = SideEffectContext {
            messages,
            ..ctx.clone()
        };
        let slot = SlotWrite {
            run_id: ctx.run_id.clone(),
            kind,
            revision: self.revisions.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let label = format!("{kind}:{}", ctx.run_id);

        self.spawner.spawn(label, move |token| async move {
            let run_id = slot.run_id.clone();
            match run_side_effect(backend, slot, job_ctx, token).await {
                Ok(Some(written)) => debug!(%run_id, %kind, written, "side effect applied"),
                Ok(None) => debug!(%run_id, %kind, "side effect superseded; result discarded"),
                Err(e) => warn!(%run_id, %kind, error = %e, "side effect failed"),
            }
        })
    }

    pub fn start_memory(
        &self,
        ctx: &SideEffectContext,
        previous: Option<TaskHandle>,
    ) -> Option<TaskHandle> {
        self.start(SideEffectKind::Memory, ctx, previous)
    }

    pub fn start_learning(
        &self,
        ctx: &SideEffectContext,
        previous: Option<TaskHandle>,
    ) -> Option<TaskHandle> {
        self.start(SideEffectKind::Learning, ctx, previous)
    }

    pub fn start_culture(
        &self,
        ctx: &SideEffectContext,
        previous: Option<TaskHandle>,
    ) -> Option<TaskHandle> {
        self.start(SideEffectKind::Culture, ctx, previous)
    }

    /// Start every automatic kind for this turn; returns how many jobs started
    pub fn trigger(&self, ctx: &SideEffectContext) -> usize {
        let mut slots = self.slots.lock();
        slots.retain(|_, handle| !handle.is_done());

        let mut started = 0;
        for kind in SideEffectKind::ALL {
            let key = (ctx.run_id.clone(), kind);
            let previous = slots.remove(&key);
            if let Some(handle) = self.start(kind, ctx, previous) {
                slots.insert(key, handle);
                started += 1;
            }
        }
        started
    }

    /// Live jobs for a run
    pub fn active_count(&self, run_id: &str) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|((id, _), handle)| id == run_id && !handle.is_done())
            .count()
    }

    /// Cancel every job of a run; returns how many were live
    pub fn cancel_run(&self, run_id: &str) -> usize {
        let mut slots = self.slots.lock();
        let keys: Vec<SlotKey> = slots
            .keys()
            .filter(|(id, _)| id == run_id)
            .cloned()
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some(handle) = slots.remove(&key) {
                if !handle.is_done() {
                    handle.cancel();
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Wait for a run's jobs; returns how many finished within the timeout
    #[instrument(skip(self))]
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> usize {
        let handles: Vec<TaskHandle> = {
            let mut slots = self.slots.lock();
            let keys: Vec<SlotKey> = slots
                .keys()
                .filter(|(id, _)| id == run_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        wait_all(handles, timeout).await
    }

    /// Wait for every job, then cancel whatever is still running
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let handles: Vec<TaskHandle> = self.slots.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return 0;
        }
        info!(tasks = handles.len(), "waiting for side-effect tasks");
        wait_all(handles, timeout).await
    }
}

/// Extract, then upsert into the slot unless superseded
///
/// `Ok(None)` means the result was discarded: the token was cancelled before
/// the write, or a newer job had already written the slot.
async fn run_side_effect(
    backend: Arc<dyn KnowledgeBackend>,
    slot: SlotWrite,
    ctx: SideEffectContext,
    token: CancellationToken,
) -> Result<Option<usize>, SideEffectError> {
    let kind = slot.kind;
    let user_id = ctx.user_id.as_deref();
    let agent_id = ctx.agent_id.as_deref();
    let mut entries = match kind {
        SideEffectKind::Memory => {
            backend
                .create_user_memories(&ctx.messages, user_id, agent_id)
                .await?
        }
        SideEffectKind::Learning => {
            backend
                .extract_learnings(&ctx.messages, user_id, agent_id)
                .await?
        }
        SideEffectKind::Culture => {
            backend
                .create_cultural_knowledge(&ctx.messages, agent_id)
                .await?
        }
    };

    if entries.is_empty() {
        return Ok(Some(0));
    }
    if token.is_cancelled() {
        return Ok(None);
    }

    let owner = entry_owner(kind, user_id, agent_id);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.id = stable_entry_id(kind, owner, &slot.run_id, position);
        entry.source_run_id.get_or_insert_with(|| ctx.run_id.clone());
    }
    match backend.upsert_entries(&slot, entries).await? {
        UpsertOutcome::Written(count) => Ok(Some(count)),
        UpsertOutcome::Stale => Ok(None),
    }
}

async fn wait_all(handles: Vec<TaskHandle>, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;

    let waits = handles.into_iter().map(|mut handle| async move {
        let label = handle.label().to_string();
        let waited = tokio::time::timeout_at(deadline, handle.wait()).await;
        let result = match waited {
            Ok(joined) => joined.map_err(SideEffectError::from),
            Err(_) => {
                handle.cancel();
                Err(SideEffectError::Timeout(label.clone()))
            }
        };
        match result {
            Ok(TaskOutcome::Completed) => true,
            Ok(TaskOutcome::Cancelled) => {
                debug!(task = %label, "side-effect task was cancelled");
                false
            }
            Err(e) => {
                warn!(task = %label, error = %e, "side-effect task did not finish cleanly");
                false
            }
        }
    });

    join_all(waits).await.into_iter().filter(|done| *done).count()
}
