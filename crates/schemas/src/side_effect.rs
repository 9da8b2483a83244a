// Side effect domain types
//
// Best-effort background writes produced by a turn: user memories, learnings
// and cultural knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of background side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Memory,
    Learning,
    Culture,
}

impl SideEffectKind {
    pub const ALL: [SideEffectKind; 3] = [Self::Memory, Self::Learning, Self::Culture];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Learning => "learning",
            Self::Culture => "culture",
        }
    }
}

impl std::fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a subsystem is wired into the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectMode {
    /// Not configured
    #[default]
    Disabled,
    /// The coordinator writes in the background after each turn
    Automatic,
    /// The model writes through a tool call; the coordinator does nothing
    Agentic,
}

impl SideEffectMode {
    pub fn runs_in_background(&self) -> bool {
        matches!(self, Self::Automatic)
    }
}

/// One upsertable unit of memory/learning/culture, keyed by a stable id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Key of the write slot (kind, owner, run, position); rewrites replace in place
    pub id: String,
    pub kind: SideEffectKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
