//! Push a passed slice and create or update its pull request.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::db::DbHandle;
use super::gates::GateReport;
use super::github::{NewPullRequest, PrHost, PullRequest, parse_github_repo};
use super::models::{GateResult, Project, RunFinal, RunKind, RunStatus, Slice, SliceState};
use super::retry::{Retried, RetryPolicy, with_retry};
use super::worktree::WorktreeManager;
use crate::audit::{Actor, AuditLog, NewAuditEntry};
use crate::errors::{PrHostError, SliceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrHandle {
    pub number: i64,
    pub url: String,
    /// `false` when an existing PR for the branch was updated.
    pub created: bool,
}

pub fn pr_title(slice: &Slice) -> String {
    format!("Slice {}: {}", slice.id, slice.title)
}

pub fn pr_body(slice: &Slice) -> String {
    let mut body = format!(
        "## Scope\n\n{}\n\n**Risk:** {}\n\n**Branch:** `{}`\n",
        slice.scope.trim(),
        slice.risk_level.as_str(),
        slice.branch_name
    );
    if !slice.out_of_scope.trim().is_empty() {
        body.push_str(&format!("\n## Out of scope\n\n{}\n", slice.out_of_scope.trim()));
    }
    if !slice.acceptance.is_empty() {
        body.push_str("\n## Acceptance criteria\n\n");
        for ac in &slice.acceptance {
            body.push_str(&format!("- **{}** {}", ac.code, ac.text));
            if !ac.verification.is_empty() {
                body.push_str(&format!(" _(verify: {})_", ac.verification));
            }
            body.push('\n');
        }
    }
    body
}

/// Gate comment: a heading and a `| Gate | Status |` table.
pub fn gates_comment(slice_id: i64, results: &[GateResult]) -> String {
    let report = GateReport {
        results: results.to_vec(),
        cancelled: false,
    };
    format!(
        "## Gates results for Slice {}\n\n{}",
        slice_id,
        report.summary()
    )
}

pub struct Publisher {
    db: DbHandle,
    audit: AuditLog,
    worktrees: Arc<WorktreeManager>,
    host: Arc<dyn PrHost>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(
        db: DbHandle,
        audit: AuditLog,
        worktrees: Arc<WorktreeManager>,
        host: Arc<dyn PrHost>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            audit,
            worktrees,
            host,
            retry,
        }
    }

    async fn retried<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PrHostError>>,
    {
        match with_retry(
            &self.retry,
            &CancellationToken::new(),
            PrHostError::is_transient,
            op,
        )
        .await
        {
            Retried::Ok { value, .. } => Ok(value),
            Retried::Failed { error, attempts } => Err(SliceError::PrHost {
                attempts,
                source: error,
            }
            .into()),
            Retried::Cancelled { attempts } => Err(anyhow::anyhow!(
                "PR host call cancelled after {} attempt(s)",
                attempts
            )),
        }
    }

    /// Find-or-create by branch. A create rejected because the PR already
    /// exists falls back to another lookup.
    async fn upsert_pr(&self, repo: &str, slice: &Slice, project: &Project) -> Result<(PullRequest, bool)> {
        let host = &self.host;
        let title = pr_title(slice);
        let body = pr_body(slice);
        let branch = slice.branch_name.as_str();

        let existing = self
            .retried(|_| host.find_open_pr(repo, branch))
            .await?;
        if let Some(pr) = existing {
            let updated = self
                .retried(|_| host.update_pr(repo, pr.number, &title, &body))
                .await?;
            return Ok((updated, false));
        }

        let new_pr = NewPullRequest {
            title: title.clone(),
            body: body.clone(),
            head: slice.branch_name.clone(),
            base: project.default_branch.clone(),
        };
        match self.retried(|_| host.create_pr(repo, &new_pr)).await {
            Ok(pr) => Ok((pr, true)),
            Err(e) => {
                let already_exists = matches!(
                    crate::errors::as_slice_error(&e),
                    Some(SliceError::PrHost {
                        source: PrHostError::Status { status: 422, .. },
                        ..
                    })
                );
                if !already_exists {
                    return Err(e);
                }
                let pr = self
                    .retried(|_| host.find_open_pr(repo, branch))
                    .await?
                    .context("PR host rejected create but no open PR exists for the branch")?;
                let updated = self
                    .retried(|_| host.update_pr(repo, pr.number, &title, &body))
                    .await?;
                Ok((updated, false))
            }
        }
    }

    /// Publish a `ci_passed` slice. Idempotent by branch.
    pub async fn publish(&self, slice_id: i64, actor: Actor) -> Result<PrHandle> {
        let slice = self.db.call(move |db| db.get_slice(slice_id)).await?;
        if slice.state != SliceState::CiPassed {
            return Err(SliceError::NotPublishable {
                slice_id,
                state: slice.state.as_str().to_string(),
            }
            .into());
        }
        let project_id = slice.project_id;
        let project = self.db.call(move |db| db.get_project(project_id)).await?;
        let repo = project
            .github_repo
            .clone()
            .or_else(|| parse_github_repo(&project.repo_url))
            .with_context(|| {
                format!(
                    "Cannot derive a GitHub owner/repo from '{}'; set it on the project",
                    project.repo_url
                )
            })?;

        let run = self
            .db
            .call(move |db| db.create_run(slice_id, RunKind::Publish))
            .await?;
        let run_id = run.id;

        let result = self.publish_inner(&slice, &project, &repo).await;
        let fin = match &result {
            Ok(handle) => RunFinal::new(RunStatus::Success).with_output(
                json!({"number": handle.number, "url": handle.url, "created": handle.created})
                    .to_string(),
            ),
            Err(e) => RunFinal::new(RunStatus::Failure).with_error(format!("{:#}", e)),
        };
        self.db.call(move |db| db.finalize_run(run_id, &fin)).await?;

        let entry = match &result {
            Ok(handle) => NewAuditEntry::slice(actor, "publish.completed", slice_id).with_payload(
                json!({"run_id": run_id, "pr_number": handle.number, "pr_url": handle.url, "created": handle.created}),
            ),
            Err(e) => NewAuditEntry::slice(actor, "publish.failed", slice_id)
                .with_payload(json!({"run_id": run_id, "error": format!("{:#}", e)})),
        };
        self.audit.record_best_effort(entry).await;
        result
    }

    async fn publish_inner(&self, slice: &Slice, project: &Project, repo: &str) -> Result<PrHandle> {
        let handle = self.worktrees.acquire(project, slice).await?;
        // Push failures need a human; they are not retried.
        let pushed = self.worktrees.push(&handle).await;
        if pushed.is_ok()
            && let Ok(sha) = self.worktrees.head_sha(&handle).await
        {
            tracing::debug!(slice_id = slice.id, sha = %sha, "published head");
        }
        self.worktrees.release(&handle).await;
        pushed?;

        let (pr, created) = self.upsert_pr(repo, slice, project).await?;
        let (slice_id, number, url) = (slice.id, pr.number, pr.html_url.clone());
        self.db
            .call(move |db| db.set_slice_pr(slice_id, number, &url))
            .await?;
        tracing::info!(slice_id, pr = pr.number, created, "pull request ready");

        let gate_run = self.db.call(move |db| db.latest_gate_run(slice_id)).await?;
        if let Some((_, results)) = gate_run {
            let body = gates_comment(slice.id, &results);
            let host = &self.host;
            if let Err(e) = self
                .retried(|_| host.comment(repo, pr.number, &body))
                .await
            {
                tracing::warn!(slice_id, pr = pr.number, error = %e, "failed to post gate comment");
                self.audit
                    .record_best_effort(
                        NewAuditEntry::slice(Actor::system(), "publish.comment_failed", slice_id)
                            .with_payload(json!({"pr_number": pr.number, "error": format!("{:#}", e)})),
                    )
                    .await;
            }
        }

        Ok(PrHandle {
            number: pr.number,
            url: pr.html_url,
            created,
        })
    }
}
