//! Append-only audit trail.
//!
//! Every engine component records what it did here. Entries are write-once:
//! the table rejects updates and deletes, and entries hold only a snapshot of
//! their subject so they outlive it.

mod logger;

pub use logger::AuditLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::engine::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid actor kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Project,
    Slice,
    Run,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Slice => "slice",
            Self::Run => "run",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "slice" => Ok(Self::Slice),
            "run" => Ok(Self::Run),
            _ => Err(format!("Invalid subject kind: {}", s)),
        }
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: "scheduler".to_string(),
        }
    }

    pub fn agent(role: Role) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: role.as_str().to_string(),
        }
    }

    pub fn human(user: &str) -> Self {
        Self {
            kind: ActorKind::Human,
            id: user.to_string(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: Actor,
    pub action: String,
    pub subject_kind: SubjectKind,
    pub subject_id: i64,
    pub payload: serde_json::Value,
}

impl NewAuditEntry {
    pub fn new(actor: Actor, action: &str, subject_kind: SubjectKind, subject_id: i64) -> Self {
        Self {
            actor,
            action: action.to_string(),
            subject_kind,
            subject_id,
            payload: serde_json::Value::Null,
        }
    }

    pub fn slice(actor: Actor, action: &str, slice_id: i64) -> Self {
        Self::new(actor, action, SubjectKind::Slice, slice_id)
    }

    pub fn run(actor: Actor, action: &str, run_id: i64) -> Self {
        Self::new(actor, action, SubjectKind::Run, run_id)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A persisted audit fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_kind: ActorKind,
    pub actor_id: String,
    pub action: String,
    pub subject_kind: SubjectKind,
    pub subject_id: i64,
    pub payload: serde_json::Value,
}
