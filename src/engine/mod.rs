//! Slice engine: lifecycle, isolation and orchestration of role agents.
//!
//! ## Module Map
//!
//! ```text
//!   scheduler.rs   (worker pool, per-slice locks, cancellation, reconcile)
//!        │
//!        │ SlicePipeline::step()
//!        v
//!   pipeline.rs    (due step per state, Run bookkeeping)
//!        │
//!        ├── context  → worktree.rs::sync_repo + context_pack.rs
//!        ├── prepare  → worktree.rs::acquire
//!        ├── pm…ops   → agent_executor.rs (llm.rs, acl.rs, retry.rs)
//!        │               then traceability.rs when the slice has quadrants
//!        └── gates    → gates.rs
//!        │
//!        │ outcome event
//!        v
//!   state_machine.rs (transition table, optimistic write via db.rs)
//!
//!   publisher.rs   (ci_passed → push branch, upsert PR via github.rs)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                        |
//! |---------------|-------------------------------------------------------|
//! | `models`      | `Slice`, `Run`, `Step`, `RunStatus`, LLM settings     |
//! | `db`          | SQLite via `DbHandle`; transition + Run + audit in one transaction |
//! | `locks`       | `KeyedLocks`: one async mutex per key                 |
//! | `quadrants`   | Role directives, trace and control items from quadrant text |
//! | `text_blocks` | Marker-delimited block upserts for shared documents   |
//!
//! Every step ends with a finalized Run. A step either feeds an outcome to
//! the state machine or leaves the slice where it was (ACL denial,
//! cancellation, environment faults).

pub mod acl;
pub mod agent_executor;
pub mod context_pack;
pub mod db;
pub mod gates;
pub mod github;
pub mod llm;
pub mod locks;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod quadrants;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod text_blocks;
pub mod traceability;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::audit::AuditLog;
use crate::config::Config;
use agent_executor::AgentExecutor;
use db::{DbHandle, SliceDb};
use gates::GateRunner;
use github::GithubClient;
use llm::HttpGenerationClient;
use pipeline::{PipelineParts, SlicePipeline};
use publisher::Publisher;
use retry::RetryPolicy;
use scheduler::Scheduler;
use worktree::WorktreeManager;

/// Open the engine's database, creating its directory as needed.
pub fn open_db(config: &Config) -> Result<DbHandle> {
    let path = config.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(DbHandle::new(SliceDb::new(&path)?))
}

/// Engine components wired from configuration.
pub struct Engine {
    pub db: DbHandle,
    pub audit: AuditLog,
    pub worktrees: Arc<WorktreeManager>,
    pub pipeline: Arc<SlicePipeline>,
    config: Config,
    retry: RetryPolicy,
}

impl Engine {
    /// `operator` selects the user LLM layer for generation calls.
    pub fn open(config: &Config, operator: Option<String>) -> Result<Self> {
        let db = open_db(config)?;
        let audit = AuditLog::new(db.clone());
        let worktrees = Arc::new(WorktreeManager::new(config.workspace_dir(), audit.clone()));
        let retry = RetryPolicy::from(&config.file.agent);
        let client = HttpGenerationClient::new(Duration::from_secs(
            config.file.agent.request_timeout_secs,
        ))?;
        let executor = AgentExecutor::new(
            Arc::new(client),
            worktrees.clone(),
            config.file.path_acl(),
            audit.clone(),
            retry,
        );
        let pipeline = Arc::new(SlicePipeline::new(PipelineParts {
            db: db.clone(),
            audit: audit.clone(),
            worktrees: worktrees.clone(),
            executor,
            gates: GateRunner::new(config.file.gates.clone()),
            acl: config.file.path_acl(),
            global_llm: config.file.llm.settings(),
            operator,
        }));
        Ok(Self {
            db,
            audit,
            worktrees,
            pipeline,
            config: config.clone(),
            retry,
        })
    }

    /// Publisher backed by the GitHub REST API. Requires a token.
    pub fn publisher(&self) -> Result<Publisher> {
        let github = &self.config.file.github;
        let token = github
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .context("No GitHub token configured; set GITHUB_TOKEN")?;
        let host = GithubClient::new(&github.api_url, token)?;
        Ok(Publisher::new(
            self.db.clone(),
            self.audit.clone(),
            self.worktrees.clone(),
            Arc::new(host),
            self.retry,
        ))
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.pipeline.clone(), self.config.file.scheduler.max_workers)
    }
}
