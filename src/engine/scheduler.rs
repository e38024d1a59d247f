//! Bounded worker pool over slices.
//!
//! Steps of different slices run in parallel up to `max_workers`; steps of
//! one slice are serialized by a per-slice lock held from worktree
//! acquisition until the step's outcome is written. Publishing and human
//! events take the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::models::{Run, RunFinal, RunStatus, Slice, SliceState};
use super::pipeline::{SlicePipeline, StepSummary};
use super::publisher::{PrHandle, Publisher};
use super::state_machine::Event;
use crate::audit::{Actor, NewAuditEntry};
use crate::errors::{SliceError, as_slice_error};

pub const INTERRUPTED: &str = "interrupted by restart";

/// How far one slice got during [`Scheduler::run_slices`].
#[derive(Debug, Clone)]
pub struct SliceProgress {
    pub slice_id: i64,
    pub steps: Vec<StepSummary>,
    pub state: Option<SliceState>,
    pub pr: Option<PrHandle>,
    pub error: Option<String>,
}

pub struct Scheduler {
    pipeline: Arc<SlicePipeline>,
    publisher: Option<Arc<Publisher>>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    tokens: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(pipeline: Arc<SlicePipeline>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            pipeline,
            publisher: None,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish slices that reach `ci_passed` during [`Self::run_slices`].
    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn token_for(&self, slice_id: i64) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(slice_id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    fn forget_token(&self, slice_id: i64) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if tokens.get(&slice_id).is_some_and(|t| t.is_cancelled()) {
            tokens.remove(&slice_id);
        }
    }

    /// Cancel the in-flight step of a slice, if any.
    pub fn cancel(&self, slice_id: i64) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(&slice_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight step.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the due step of one slice under a worker permit and the slice
    /// lock. A concurrent modification is retried once against fresh state.
    pub async fn run_step(&self, slice_id: i64) -> Result<Option<StepSummary>> {
        let _permit = self.workers.clone().acquire_owned().await?;
        let _lock = self.pipeline.worktrees().lock_slice(slice_id).await?;
        let token = self.token_for(slice_id);

        let mut result = self.pipeline.step(slice_id, &token).await;
        if let Err(e) = &result
            && matches!(as_slice_error(e), Some(SliceError::ConcurrentModification { .. }))
        {
            tracing::warn!(slice_id, "concurrent modification, retrying step once");
            result = self.pipeline.step(slice_id, &token).await;
        }
        self.forget_token(slice_id);
        result
    }

    async fn drive(&self, slice_id: i64) -> SliceProgress {
        let mut progress = SliceProgress {
            slice_id,
            steps: Vec::new(),
            state: None,
            pr: None,
            error: None,
        };
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.run_step(slice_id).await {
                Ok(Some(summary)) => {
                    let advanced = summary.advanced;
                    progress.state = Some(summary.slice.state);
                    progress.steps.push(summary);
                    if !advanced {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(slice_id, error = %format!("{:#}", e), "slice stopped");
                    progress.error = Some(format!("{:#}", e));
                    break;
                }
            }
        }

        if progress.state == Some(SliceState::CiPassed) && self.publisher.is_some() {
            match self.publish(slice_id, Actor::system()).await {
                Ok(pr) => progress.pr = Some(pr),
                Err(e) => progress.error = Some(format!("{:#}", e)),
            }
        }
        progress
    }

    /// Publish a slice under its lock.
    pub async fn publish(&self, slice_id: i64, actor: Actor) -> Result<PrHandle> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No PR publisher configured"))?;
        let _lock = self.pipeline.worktrees().lock_slice(slice_id).await?;
        publisher.publish(slice_id, actor).await
    }

    /// Apply `remediate` or `abandon` under the slice lock. Abandoning
    /// cancels an in-flight step first.
    pub async fn human_event(&self, slice_id: i64, event: Event, user: &str) -> Result<Slice> {
        if event == Event::Abandon {
            self.cancel(slice_id);
        }
        let _lock = self.pipeline.worktrees().lock_slice(slice_id).await?;
        self.pipeline.human_event(slice_id, event, user).await
    }

    /// Drive each slice until nothing more is due, it parks, or it fails.
    pub async fn run_slices(self: &Arc<Self>, slice_ids: &[i64]) -> Vec<SliceProgress> {
        let mut set = JoinSet::new();
        for &slice_id in slice_ids {
            let this = Arc::clone(self);
            set.spawn(async move { this.drive(slice_id).await });
        }
        let mut out = Vec::with_capacity(slice_ids.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(progress) => out.push(progress),
                Err(e) => tracing::error!(error = %e, "slice task panicked"),
            }
        }
        out.sort_by_key(|p| p.slice_id);
        out
    }

    /// Finalize Runs left `running` by a previous process as `error`.
    /// Slice state is untouched so the step is due again.
    pub async fn reconcile(&self) -> Result<Vec<Run>> {
        let db = self.pipeline.db().clone();
        let audit = self.pipeline.audit().clone();
        let stale = db.call(|db| db.list_unfinished_runs()).await?;
        let mut reconciled = Vec::with_capacity(stale.len());
        for run in stale {
            let run_id = run.id;
            let fin = RunFinal::new(RunStatus::Error)
                .with_attempts(run.attempts)
                .with_error(INTERRUPTED)
                .parked();
            let run = db.call(move |db| db.finalize_run(run_id, &fin)).await?;
            audit
                .record(
                    NewAuditEntry::run(Actor::system(), "run.reconciled", run_id).with_payload(
                        json!({
                            "slice_id": run.slice_id,
                            "kind": run.kind.as_str(),
                            "reason": INTERRUPTED,
                        }),
                    ),
                )
                .await?;
            tracing::warn!(run_id, slice_id = run.slice_id, "reconciled interrupted run");
            reconciled.push(run);
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateSpec;
    use crate::engine::agent_executor::tests::{ScriptedClient, files};
    use crate::engine::llm::{Generation, GenerationClient, GenerationRequest};
    use crate::engine::models::{NewSlice, RiskLevel, Role, RunKind, Step};
    use crate::errors::GenerationError;
    use async_trait::async_trait;
    use crate::engine::pipeline::tests::pipeline;
    use crate::engine::publisher::tests::FakePrHost;
    use crate::engine::retry::RetryPolicy;
    use crate::engine::worktree::tests::fixture;
    use std::time::Duration;

    /// Answers each role with a file inside its prefixes, for any slice.
    struct RoleClient;

    #[async_trait]
    impl GenerationClient for RoleClient {
        async fn generate(&self, req: &GenerationRequest) -> Result<Generation, GenerationError> {
            let (path, content) = match req.role {
                Role::Pm => ("docs/PRD.md", "# PRD\n"),
                Role::Architect => ("docs/DESIGN.md", "# Design\n"),
                Role::Dev => ("src/app.py", "x = 1\n"),
                Role::Qa => ("tests/test_app.py", "def test(): pass\n"),
                Role::Ops => ("docs/RUNBOOK.md", "# Runbook\n"),
            };
            Ok(files(&[(path, content)]))
        }
    }

    #[tokio::test]
    async fn same_slice_steps_are_serialized() {
        let f = fixture();
        let p = pipeline(&f, Arc::new(ScriptedClient::new(vec![])), vec![]);
        let scheduler = Arc::new(Scheduler::new(Arc::new(p), 4));

        let (a, b) = tokio::join!(
            scheduler.run_step(f.slice.id),
            scheduler.run_step(f.slice.id)
        );
        let mut steps = vec![a.unwrap().unwrap().step, b.unwrap().unwrap().step];
        steps.sort_by_key(|s| s.as_str());
        assert_eq!(steps, [Step::Context, Step::Prepare]);

        let slice_id = f.slice.id;
        let slice = f.db.call(move |db| db.get_slice(slice_id)).await.unwrap();
        assert_eq!(slice.state, SliceState::Pm);
    }

    #[tokio::test]
    async fn slices_run_to_ci_passed_in_parallel() {
        let f = fixture();
        let project_id = f.project.id;
        let second = f
            .db
            .call(move |db| {
                db.create_slice(&NewSlice {
                    project_id,
                    title: "Add logout".into(),
                    scope: "logout".into(),
                    out_of_scope: String::new(),
                    risk_level: RiskLevel::Medium,
                    acceptance: vec![],
                })
            })
            .await
            .unwrap();
        let p = pipeline(
            &f,
            Arc::new(RoleClient),
            vec![GateSpec::new("test", "true", 10)],
        );
        let scheduler = Arc::new(Scheduler::new(Arc::new(p), 2));

        let progress = scheduler.run_slices(&[f.slice.id, second.id]).await;
        assert_eq!(progress.len(), 2);
        for p in &progress {
            assert_eq!(p.state, Some(SliceState::CiPassed), "{:?}", p.error);
            assert_eq!(p.steps.len(), 8);
        }
    }

    /// Drive the fixture slice to `ci_passed` and attach a fake PR host.
    async fn passed_scheduler(
        f: &crate::engine::worktree::tests::Fixture,
        host: Arc<FakePrHost>,
    ) -> Arc<Scheduler> {
        let p = Arc::new(pipeline(
            f,
            Arc::new(RoleClient),
            vec![GateSpec::new("test", "true", 10)],
        ));
        let publisher = Publisher::new(
            f.db.clone(),
            p.audit().clone(),
            p.worktrees().clone(),
            host,
            RetryPolicy::default().with_delays(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let scheduler = Arc::new(Scheduler::new(p, 2).with_publisher(Arc::new(publisher)));
        let progress = scheduler.run_slices(&[f.slice.id]).await;
        assert_eq!(progress[0].state, Some(SliceState::CiPassed));
        scheduler
    }

    #[tokio::test]
    async fn concurrent_publishes_share_one_pr() {
        let f = fixture();
        let host = Arc::new(FakePrHost::default());
        let scheduler = passed_scheduler(&f, host.clone()).await;
        // run_slices already published once.
        assert_eq!(*host.creates.lock().unwrap(), 1);

        let (a, b) = tokio::join!(
            scheduler.publish(f.slice.id, Actor::system()),
            scheduler.publish(f.slice.id, Actor::system())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(!a.created && !b.created);
        assert_eq!(a.number, b.number);
        assert_eq!(*host.creates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn abandon_racing_publish_never_breaks_the_push() {
        let f = fixture();
        let host = Arc::new(FakePrHost::default());
        let scheduler = passed_scheduler(&f, host).await;

        let (published, abandoned) = tokio::join!(
            scheduler.publish(f.slice.id, Actor::system()),
            scheduler.human_event(f.slice.id, Event::Abandon, "alice")
        );
        assert_eq!(abandoned.unwrap().state, SliceState::Abandoned);
        if let Err(e) = published {
            assert!(
                matches!(as_slice_error(&e), Some(SliceError::NotPublishable { .. })),
                "{:#}",
                e
            );
        }
    }

    #[tokio::test]
    async fn cancelled_gates_leave_slice_in_ops() {
        let f = fixture();
        let p = pipeline(
            &f,
            Arc::new(RoleClient),
            vec![GateSpec::new("slow", "sleep 30", 60)],
        );
        let scheduler = Arc::new(Scheduler::new(Arc::new(p), 1));
        for _ in 0..7 {
            scheduler.run_step(f.slice.id).await.unwrap().unwrap();
        }

        let trigger = Arc::clone(&scheduler);
        let slice_id = f.slice.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel(slice_id);
        });
        let summary = scheduler.run_step(slice_id).await.unwrap().unwrap();
        assert_eq!(summary.step, Step::Gates);
        assert_eq!(summary.run.status, RunStatus::Cancelled);
        assert!(!summary.advanced);
        assert_eq!(summary.slice.state, SliceState::Ops);

        // Cancelled runs don't count; gates stay due with a fresh token.
        let next = scheduler.pipeline.due_step(&summary.slice).await.unwrap();
        assert_eq!(next, Some(Step::Gates));
    }

    #[tokio::test]
    async fn reconcile_marks_running_runs_as_error() {
        let f = fixture();
        let slice_id = f.slice.id;
        let stale = f
            .db
            .call(move |db| db.create_run(slice_id, RunKind::Step(Step::Context)))
            .await
            .unwrap();
        let p = pipeline(&f, Arc::new(ScriptedClient::new(vec![])), vec![]);
        let scheduler = Scheduler::new(Arc::new(p), 1);

        let reconciled = scheduler.reconcile().await.unwrap();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].id, stale.id);
        assert_eq!(reconciled[0].status, RunStatus::Error);
        assert_eq!(reconciled[0].error.as_deref(), Some(INTERRUPTED));
        assert!(reconciled[0].parked);

        let slice = f.db.call(move |db| db.get_slice(slice_id)).await.unwrap();
        assert_eq!(slice.state, SliceState::Draft);
        assert!(scheduler.reconcile().await.unwrap().is_empty());

        let audit = f.db.call(|db| db.list_audit(None)).await.unwrap();
        assert!(audit.iter().any(|e| e.action == "run.reconciled"));
    }
}
