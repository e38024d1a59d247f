//! Typed error taxonomy for the slice engine.
//!
//! `SliceError` covers every failure that changes orchestration control flow.
//! Plumbing code returns `anyhow::Result` and wraps these; orchestration seams
//! recover them with `downcast_ref::<SliceError>()`.

use thiserror::Error;

/// Failure modes of the external generation capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("generation request timed out")]
    Timeout,

    #[error("generation endpoint rejected credentials ({status})")]
    Auth { status: u16 },

    #[error("generation endpoint unavailable: {0}")]
    Transport(String),

    #[error("generation endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed generation response: {0}")]
    Malformed(String),
}

impl GenerationError {
    /// Transient failures are retried under the executor's backoff policy.
    /// Malformed responses and rejected requests are hard failures.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            GenerationError::Malformed(_) | GenerationError::Rejected { .. }
        )
    }
}

/// Failure of a call to the PR-hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrHostError {
    #[error("PR host unreachable: {0}")]
    Transport(String),

    #[error("PR host returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected PR host response: {0}")]
    Malformed(String),
}

impl PrHostError {
    /// Network faults, rate limits, server errors and credential rejections
    /// are retried; other client errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PrHostError::Transport(_) => true,
            PrHostError::Status { status, .. } => {
                matches!(status, 401 | 403 | 429) || *status >= 500
            }
            PrHostError::Malformed(_) => false,
        }
    }
}

/// Errors raised by the lifecycle engine.
#[derive(Debug, Error)]
pub enum SliceError {
    #[error("Invalid transition: event '{event}' is not legal from state '{from}'")]
    InvalidTransition { from: String, event: String },

    #[error("Worktree creation failed for slice {slice_id}: {reason}")]
    WorktreeCreationError { slice_id: i64, reason: String },

    #[error("Commit failed for slice {slice_id}: {reason}")]
    CommitError { slice_id: i64, reason: String },

    #[error("Nothing to commit for slice {slice_id}")]
    NothingToCommit { slice_id: i64 },

    #[error("Path access denied: role '{role}' may not write '{path}'")]
    PathAccessDenied { role: String, path: String },

    #[error("Gate '{gate}' timed out after {timeout_secs}s")]
    GateTimeout { gate: String, timeout_secs: u64 },

    #[error("Gate '{gate}' failed with exit code {exit_code}")]
    GateCheckFailed { gate: String, exit_code: i32 },

    #[error("Gate '{gate}' is unavailable: {reason}")]
    GateUnavailable { gate: String, reason: String },

    #[error("Push of branch '{branch}' rejected: {reason}")]
    PushRejected { branch: String, reason: String },

    #[error("Push of branch '{branch}' failed authentication: {reason}")]
    PushAuthError { branch: String, reason: String },

    #[error("Concurrent modification of slice {slice_id}: expected state '{expected}'")]
    ConcurrentModification { slice_id: i64, expected: String },

    #[error("Generation failed after {attempts} attempt(s): {source}")]
    Generation {
        attempts: u32,
        #[source]
        source: GenerationError,
    },

    #[error("PR host error after {attempts} attempt(s): {source}")]
    PrHost {
        attempts: u32,
        #[source]
        source: PrHostError,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Slice {slice_id} is not publishable from state '{state}'")]
    NotPublishable { slice_id: i64, state: String },

    #[error("Project {project_id} still has {count} active slice(s)")]
    ProjectHasActiveSlices { project_id: i64, count: i64 },

    #[error("User '{user}' is not an owner of project {project_id}")]
    Unauthorized { user: String, project_id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SliceError {
    /// Environment and policy faults that park the slice instead of failing it.
    pub fn parks_slice(&self) -> bool {
        matches!(
            self,
            SliceError::WorktreeCreationError { .. }
                | SliceError::CommitError { .. }
                | SliceError::PathAccessDenied { .. }
                | SliceError::PushRejected { .. }
                | SliceError::PushAuthError { .. }
        )
    }
}

/// Find a `SliceError` anywhere in an `anyhow` chain.
pub fn as_slice_error(err: &anyhow::Error) -> Option<&SliceError> {
    err.chain().find_map(|e| e.downcast_ref::<SliceError>())
}
