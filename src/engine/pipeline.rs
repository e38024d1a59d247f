//! Runs the step that is due for a slice and feeds its outcome to the state
//! machine.
//!
//! Step due per state:
//!
//! | state           | step                                              |
//! |-----------------|---------------------------------------------------|
//! | `draft`         | `context` (sync repository, build context pack)   |
//! | `context_ready` | `prepare` (acquire worktree)                      |
//! | `pm` … `qa`     | the role's agent step                             |
//! | `ops`           | `ops`, or `gates` once the latest ops/gates Run is an ops success |
//!
//! Parked Runs (finalised without an event) do not count as the latest Run.
//!
//! An agent Run that advances the slice is followed by a best-effort
//! traceability pass when the slice has four-quadrant requirements.
//!
//! Nothing is due in `ci_passed`, `ci_failed` or `abandoned`.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::acl::PathAcl;
use super::agent_executor::{AgentCall, AgentExecutor, StepReport};
use super::context_pack::build_context_pack;
use super::db::DbHandle;
use super::gates::GateRunner;
use super::llm::resolve_llm_config;
use super::models::{
    LlmConfig, LlmSettings, Project, Role, Run, RunFinal, RunKind, RunStatus, Slice, SliceState, Step,
    StepOutcome,
};
use super::state_machine::{Event, SliceStateMachine};
use super::traceability::Traceability;
use super::worktree::{WorktreeHandle, WorktreeManager};
use crate::audit::{Actor, AuditLog, NewAuditEntry};
use crate::errors::as_slice_error;
use crate::util::clamp_text;

const CONTEXT_OUTPUT_LIMIT: usize = 100_000;

/// What one call to [`SlicePipeline::step`] did.
#[derive(Debug, Clone)]
pub struct StepSummary {
    pub step: Step,
    pub run: Run,
    pub slice: Slice,
    /// `false` when the Run was parked without a state change.
    pub advanced: bool,
}

pub struct SlicePipeline {
    db: DbHandle,
    audit: AuditLog,
    machine: SliceStateMachine,
    traceability: Traceability,
    worktrees: Arc<WorktreeManager>,
    executor: AgentExecutor,
    gates: GateRunner,
    acl: PathAcl,
    global_llm: LlmSettings,
    operator: Option<String>,
}

pub struct PipelineParts {
    pub db: DbHandle,
    pub audit: AuditLog,
    pub worktrees: Arc<WorktreeManager>,
    pub executor: AgentExecutor,
    pub gates: GateRunner,
    pub acl: PathAcl,
    pub global_llm: LlmSettings,
    /// User whose LLM layer applies to generation calls.
    pub operator: Option<String>,
}

impl SlicePipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            machine: SliceStateMachine::new(parts.db.clone(), parts.audit.clone()),
            traceability: Traceability::new(parts.db.clone(), parts.audit.clone()),
            db: parts.db,
            audit: parts.audit,
            worktrees: parts.worktrees,
            executor: parts.executor,
            gates: parts.gates,
            acl: parts.acl,
            global_llm: parts.global_llm,
            operator: parts.operator,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    pub fn traceability(&self) -> &Traceability {
        &self.traceability
    }

    /// The step due for `slice`, if any.
    pub async fn due_step(&self, slice: &Slice) -> Result<Option<Step>> {
        let step = match slice.state {
            SliceState::Draft => Some(Step::Context),
            SliceState::ContextReady => Some(Step::Prepare),
            SliceState::Ops => {
                let slice_id = slice.id;
                let last = self
                    .db
                    .call(move |db| {
                        db.last_completed_run(
                            slice_id,
                            &[RunKind::Step(Step::Agent(Role::Ops)), RunKind::Step(Step::Gates)],
                        )
                    })
                    .await?;
                match last {
                    Some(run)
                        if run.kind == RunKind::Step(Step::Agent(Role::Ops))
                            && run.status == RunStatus::Success =>
                    {
                        Some(Step::Gates)
                    }
                    _ => Some(Step::Agent(Role::Ops)),
                }
            }
            state => state.role().map(Step::Agent),
        };
        Ok(step)
    }

    /// Run the due step for a slice. `None` when nothing is due.
    ///
    /// Callers must hold the slice's lock.
    pub async fn step(&self, slice_id: i64, cancel: &CancellationToken) -> Result<Option<StepSummary>> {
        let slice = self.db.call(move |db| db.get_slice(slice_id)).await?;
        let Some(step) = self.due_step(&slice).await? else {
            return Ok(None);
        };
        let project_id = slice.project_id;
        let project = self.db.call(move |db| db.get_project(project_id)).await?;

        let run = self
            .db
            .call(move |db| db.create_run(slice_id, RunKind::Step(step)))
            .await?;
        let run_id = run.id;
        tracing::info!(slice_id, run_id, %step, state = %slice.state, "step started");

        let report = match self.dispatch(step, &slice, &project, run_id, cancel).await {
            Ok(report) => report,
            Err(e) => {
                let parks = as_slice_error(&e).is_some_and(|se| se.parks_slice());
                tracing::error!(slice_id, run_id, %step, error = %format!("{:#}", e), parks, "step failed");
                if parks {
                    StepReport::parked(RunStatus::Error, format!("{:#}", e))
                } else {
                    StepReport::new(
                        RunFinal::new(RunStatus::Error).with_error(format!("{:#}", e)),
                        Some(StepOutcome::Error),
                    )
                }
            }
        };

        let actor = match step {
            Step::Agent(role) => Actor::agent(role),
            _ => Actor::system(),
        };

        let succeeded = report.event == Some(StepOutcome::Success);
        let (slice, advanced) = match report.event {
            Some(outcome) => {
                let updated = self
                    .machine
                    .advance(
                        &slice,
                        Event::Completed { step, outcome },
                        actor,
                        Some((run_id, report.fin)),
                    )
                    .await?;
                (updated, true)
            }
            None => {
                let fin = report.fin.parked();
                let status = fin.status();
                let error = fin.error.clone();
                self.db.call(move |db| db.finalize_run(run_id, &fin)).await?;
                self.audit
                    .record_best_effort(
                        NewAuditEntry::slice(actor, "run.parked", slice_id).with_payload(json!({
                            "run_id": run_id,
                            "step": step.as_str(),
                            "status": status.as_str(),
                            "error": error,
                        })),
                    )
                    .await;
                tracing::warn!(slice_id, run_id, %step, status = status.as_str(), "run parked, slice unchanged");
                (slice, false)
            }
        };

        if advanced && succeeded && matches!(step, Step::Agent(_)) {
            self.trace_run(&slice, &project, run_id).await;
        }

        if slice.state == SliceState::CiPassed {
            // The branch carries the work from here on.
            self.release_worktree(&slice).await;
        }

        let run = self.db.call(move |db| db.get_run(run_id)).await?;
        Ok(Some(StepSummary {
            step,
            run,
            slice,
            advanced,
        }))
    }

    /// Traceability pass for an agent Run. Failures are logged and audited
    /// but leave the Run and the slice as they are.
    async fn trace_run(&self, slice: &Slice, project: &Project, run_id: i64) {
        let worktree = self.worktrees.worktree_path(project.id, slice.id);
        let result = match self.db.call(move |db| db.get_run(run_id)).await {
            Ok(run) => self.traceability.record_run(slice, &run, &worktree).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let error = format!("{:#}", e);
            tracing::warn!(slice_id = slice.id, run_id, error = %error, "trace audit failed");
            self.audit
                .record_best_effort(
                    NewAuditEntry::slice(Actor::system(), "trace.failed", slice.id)
                        .with_payload(json!({"run_id": run_id, "error": error})),
                )
                .await;
        }
    }

    async fn dispatch(
        &self,
        step: Step,
        slice: &Slice,
        project: &Project,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        match step {
            Step::Context => self.context_step(slice, project).await,
            Step::Prepare => self.prepare_step(slice, project).await,
            Step::Agent(role) => self.agent_step(slice, project, role, run_id, cancel).await,
            Step::Gates => self.gates_step(slice, project, run_id, cancel).await,
        }
    }

    async fn context_step(&self, slice: &Slice, project: &Project) -> Result<StepReport> {
        let repo = self.worktrees.sync_repo(project).await?;
        let bundle = build_context_pack(&repo, slice, None, &self.acl, self.gates.gates())?;
        let output = serde_json::to_string_pretty(&bundle)?;
        Ok(StepReport::new(
            RunFinal::new(RunStatus::Success).with_output(clamp_text(&output, CONTEXT_OUTPUT_LIMIT)),
            Some(StepOutcome::Success),
        ))
    }

    async fn prepare_step(&self, slice: &Slice, project: &Project) -> Result<StepReport> {
        let handle = self.worktrees.acquire(project, slice).await?;
        Ok(StepReport::new(
            RunFinal::new(RunStatus::Success).with_output(
                json!({"path": handle.path.display().to_string(), "branch": handle.branch})
                    .to_string(),
            ),
            Some(StepOutcome::Success),
        ))
    }

    async fn resolve_llm(&self, project_id: i64) -> Result<Option<LlmConfig>> {
        let operator = self.operator.clone();
        let (user, project) = self
            .db
            .call(move |db| {
                let user = match operator {
                    Some(user) => db.user_llm_settings(&user)?,
                    None => None,
                };
                Ok((user, db.project_llm_settings(project_id)?))
            })
            .await?;
        Ok(resolve_llm_config(
            user.as_ref(),
            project.as_ref(),
            Some(&self.global_llm),
        ))
    }

    async fn agent_step(
        &self,
        slice: &Slice,
        project: &Project,
        role: Role,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let Some(llm) = self.resolve_llm(project.id).await? else {
            return Ok(StepReport::parked(
                RunStatus::Error,
                "no complete LLM configuration (user, project or global)",
            ));
        };
        let handle = self.worktrees.acquire(project, slice).await?;
        let quadrants = self.traceability.quadrants(slice.id).await?;
        let bundle = build_context_pack(
            &handle.path,
            slice,
            Some(role),
            &self.acl,
            self.gates.gates(),
        )?
        .with_quadrants(quadrants);
        Ok(self
            .executor
            .execute(AgentCall {
                slice,
                role,
                bundle: &bundle,
                llm,
                worktree: &handle,
                run_id,
                cancel,
            })
            .await)
    }

    async fn gates_step(
        &self,
        slice: &Slice,
        project: &Project,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let handle = self.worktrees.acquire(project, slice).await?;
        let report = self.gates.run(&handle.path, cancel).await;

        let results = report.results.clone();
        self.db
            .call(move |db| db.insert_gate_results(run_id, &results))
            .await?;

        let outcome = report.outcome();
        let status = match outcome {
            Some(StepOutcome::Success) => RunStatus::Success,
            Some(StepOutcome::Failure) => RunStatus::Failure,
            Some(StepOutcome::Error) => RunStatus::Error,
            None => RunStatus::Cancelled,
        };
        let mut fin = RunFinal::new(status).with_output(report.summary());
        if let Some(err) = report.first_error(self.gates.gates()) {
            fin = fin.with_error(err.to_string());
        } else if report.cancelled {
            fin = fin.with_error("cancelled during gate checks");
        }

        self.audit
            .record_best_effort(
                NewAuditEntry::run(Actor::system(), "gates.completed", run_id).with_payload(json!({
                    "slice_id": slice.id,
                    "passed": report.passed(),
                    "cancelled": report.cancelled,
                    "results": report.results.iter().map(|r| json!({
                        "name": r.name,
                        "passed": r.passed,
                        "failure": r.failure.map(|f| f.as_str()),
                        "exit_code": r.exit_code,
                    })).collect::<Vec<_>>(),
                })),
            )
            .await;
        Ok(StepReport::new(fin, outcome))
    }

    /// Apply a human event (`remediate` or `abandon`).
    ///
    /// Callers must hold the slice's lock.
    pub async fn human_event(&self, slice_id: i64, event: Event, user: &str) -> Result<Slice> {
        let slice = self.db.call(move |db| db.get_slice(slice_id)).await?;
        let updated = self
            .machine
            .advance(&slice, event, Actor::human(user), None)
            .await?;
        if updated.state == SliceState::Abandoned {
            self.release_worktree(&updated).await;
        }
        Ok(updated)
    }

    async fn release_worktree(&self, slice: &Slice) {
        let path = self.worktrees.worktree_path(slice.project_id, slice.id);
        if !path.exists() {
            return;
        }
        let handle = WorktreeHandle {
            slice_id: slice.id,
            project_id: slice.project_id,
            path,
            branch: slice.branch_name.clone(),
        };
        self.worktrees.release(&handle).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::GateSpec;
    use crate::engine::agent_executor::tests::{ScriptedClient, default_acl, files};
    use crate::engine::llm::GenerationClient;
    use crate::engine::models::{GateFailure, TraceStatus};
    use crate::engine::retry::RetryPolicy;
    use crate::engine::worktree::tests::{Fixture, fixture};
    use crate::errors::GenerationError;
    use std::time::Duration;

    pub(crate) fn global_llm() -> LlmSettings {
        LlmSettings {
            provider: "openai-compatible".into(),
            base_url: "http://localhost:1/v1".into(),
            api_key: "sk-test-global".into(),
            model: "m".into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub(crate) fn pipeline(
        f: &Fixture,
        client: Arc<dyn GenerationClient>,
        gates: Vec<GateSpec>,
    ) -> SlicePipeline {
        let audit = AuditLog::new(f.db.clone());
        let worktrees = Arc::new(WorktreeManager::new(
            f.workspace.path().to_path_buf(),
            audit.clone(),
        ));
        let executor = AgentExecutor::new(
            client,
            worktrees.clone(),
            default_acl(),
            audit.clone(),
            RetryPolicy::default().with_delays(Duration::from_millis(1), Duration::from_millis(2)),
        );
        SlicePipeline::new(PipelineParts {
            db: f.db.clone(),
            audit,
            worktrees,
            executor,
            gates: GateRunner::new(gates),
            acl: default_acl(),
            global_llm: global_llm(),
            operator: None,
        })
    }

    fn happy_script() -> Vec<Result<crate::engine::llm::Generation, GenerationError>> {
        vec![
            Ok(files(&[("docs/PRD.md", "# PRD\n"), ("docs/ACCEPTANCE.md", "AC1\n")])),
            Ok(files(&[("docs/DESIGN.md", "# Design\n")])),
            Ok(files(&[("src/app.py", "print('hi')\n")])),
            Ok(files(&[("tests/test_app.py", "def test(): pass\n")])),
            Ok(files(&[("docs/RUNBOOK.md", "# Runbook\n")])),
        ]
    }

    async fn drive(p: &SlicePipeline, slice_id: i64) -> Vec<StepSummary> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(summary) = p.step(slice_id, &cancel).await.unwrap() {
            let stop = !summary.advanced;
            out.push(summary);
            if stop || out.len() > 20 {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn happy_path_reaches_ci_passed() {
        let f = fixture();
        let p = pipeline(
            &f,
            Arc::new(ScriptedClient::new(happy_script())),
            vec![GateSpec::new("lint", "true", 10), GateSpec::new("test", "test -f src/app.py", 10)],
        );

        let steps = drive(&p, f.slice.id).await;
        let names: Vec<&str> = steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            names,
            ["context", "prepare", "pm", "architect", "dev", "qa", "ops", "gates"]
        );
        let last = steps.last().unwrap();
        assert_eq!(last.slice.state, SliceState::CiPassed);
        assert_eq!(last.run.status, RunStatus::Success);
        // Worktree released once passed; branch kept.
        assert!(!p.worktrees().worktree_path(f.project.id, f.slice.id).exists());
    }

    #[tokio::test]
    async fn agent_runs_feed_trace_items_and_coverage() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(happy_script()));
        let p = pipeline(&f, client.clone(), vec![GateSpec::new("lint", "true", 10)]);
        p.traceability()
            .set_quadrants(
                f.slice.id,
                crate::engine::models::Quadrants {
                    functional_core: "Greet the user".into(),
                    semantic_contract: "- Greeting is printed exactly once".into(),
                    exceptions: "- Missing name falls back to hi".into(),
                    ..Default::default()
                },
                Actor::human("alice"),
            )
            .await
            .unwrap();

        let steps = drive(&p, f.slice.id).await;
        assert_eq!(steps.last().unwrap().slice.state, SliceState::CiPassed);

        let instructions = client.instructions.lock().unwrap().clone();
        assert_eq!(instructions.len(), 5);
        assert!(instructions[0].contains("### Directive for pm"));
        assert!(instructions[2].contains("### Directive for dev"));

        let overview = p.traceability().overview(f.slice.id).await.unwrap();
        let status = |code: &str| {
            overview
                .items
                .iter()
                .find(|i| i.code == code)
                .map(|i| i.status)
                .unwrap()
        };
        assert_eq!(status("FC-001"), TraceStatus::Compliant);
        assert_eq!(status("SC-001"), TraceStatus::Compliant);
        assert_eq!(status("EX-001"), TraceStatus::Pending);
        let sc = overview.items.iter().find(|i| i.code == "SC-001").unwrap();
        assert_eq!(sc.target_files, vec!["src/app.py".to_string()]);

        let report = overview.report.unwrap();
        assert_eq!((report.total, report.passed), (3, 2));
        let ops_run = steps
            .iter()
            .find(|s| s.step == Step::Agent(Role::Ops))
            .unwrap();
        assert_eq!(report.run_id, Some(ops_run.run.id));

        let audit = f.db.call(|db| db.list_audit(None)).await.unwrap();
        assert_eq!(
            audit.iter().filter(|e| e.action == "trace.audited").count(),
            5
        );
        assert!(!audit.iter().any(|e| e.action == "trace.failed"));
    }

    #[tokio::test]
    async fn lint_failure_with_passing_test_fails_run_and_persists_both() {
        let f = fixture();
        let p = pipeline(
            &f,
            Arc::new(ScriptedClient::new(happy_script())),
            vec![GateSpec::new("lint", "exit 1", 10), GateSpec::new("test", "true", 10)],
        );
        let steps = drive(&p, f.slice.id).await;
        let gates = steps.last().unwrap();
        assert_eq!(gates.step, Step::Gates);
        assert_eq!(gates.run.status, RunStatus::Failure);
        assert_eq!(gates.slice.state, SliceState::CiFailed);
        assert_eq!(gates.slice.failed_step, Some(Step::Gates));

        let run_id = gates.run.id;
        let results = f.db.call(move |db| db.gate_results(run_id)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].failure, Some(GateFailure::CheckFailed));
        assert!(results[1].passed);

        // Remediation re-enters dev.
        let slice = p
            .human_event(f.slice.id, Event::Remediate, "alice")
            .await
            .unwrap();
        assert_eq!(slice.state, SliceState::Dev);
    }

    #[tokio::test]
    async fn acl_violation_in_dev_keeps_slice_in_dev() {
        let f = fixture();
        let mut script = happy_script();
        script[2] = Ok(files(&[("src/app.py", "print()\n"), ("docs/x.md", "no\n")]));
        let p = pipeline(&f, Arc::new(ScriptedClient::new(script)), vec![]);

        let steps = drive(&p, f.slice.id).await;
        let last = steps.last().unwrap();
        assert_eq!(last.step, Step::Agent(Role::Dev));
        assert!(!last.advanced);
        assert_eq!(last.slice.state, SliceState::Dev);
        assert_eq!(last.run.status, RunStatus::Failure);

        let handle_path = p.worktrees().worktree_path(f.project.id, f.slice.id);
        assert!(!handle_path.join("src/app.py").exists());
    }

    #[tokio::test]
    async fn escaping_path_in_dev_is_access_denied_not_ci_failed() {
        let f = fixture();
        let mut script = happy_script();
        script[2] = Ok(files(&[("src/app.py", "print()\n"), ("../../etc/x", "no\n")]));
        let p = pipeline(&f, Arc::new(ScriptedClient::new(script)), vec![]);

        let steps = drive(&p, f.slice.id).await;
        let last = steps.last().unwrap();
        assert_eq!(last.step, Step::Agent(Role::Dev));
        assert!(!last.advanced);
        assert!(last.run.parked);
        assert_eq!(last.slice.state, SliceState::Dev);
        assert!(last.run.error.as_deref().unwrap().contains("../../etc/x"));

        let audit = f.db.call(|db| db.list_audit(None)).await.unwrap();
        assert!(audit.iter().any(|e| e.action == "acl.denied"));
        assert_eq!(
            p.due_step(&last.slice).await.unwrap(),
            Some(Step::Agent(Role::Dev))
        );
    }

    #[tokio::test]
    async fn parked_gates_run_keeps_gates_due() {
        let f = fixture();
        let p = pipeline(
            &f,
            Arc::new(ScriptedClient::new(happy_script())),
            vec![GateSpec::new("lint", "true", 10)],
        );
        let cancel = CancellationToken::new();
        for _ in 0..7 {
            p.step(f.slice.id, &cancel).await.unwrap().unwrap();
        }

        // Worktree, shared clone and origin all gone: acquisition fails.
        std::fs::remove_dir_all(p.worktrees().worktree_path(f.project.id, f.slice.id)).unwrap();
        std::fs::remove_dir_all(p.worktrees().repo_dir(f.project.id)).unwrap();
        std::fs::remove_dir_all(f.origin.path()).unwrap();

        let summary = p.step(f.slice.id, &cancel).await.unwrap().unwrap();
        assert_eq!(summary.step, Step::Gates);
        assert!(!summary.advanced);
        assert!(summary.run.parked);
        assert_eq!(summary.run.status, RunStatus::Error);
        assert_eq!(summary.slice.state, SliceState::Ops);

        assert_eq!(p.due_step(&summary.slice).await.unwrap(), Some(Step::Gates));
    }

    #[tokio::test]
    async fn missing_llm_configuration_parks_agent_step() {
        let f = fixture();
        let mut p = pipeline(&f, Arc::new(ScriptedClient::new(vec![])), vec![]);
        p.global_llm = LlmSettings::default();
        let steps = drive(&p, f.slice.id).await;
        let last = steps.last().unwrap();
        assert_eq!(last.step, Step::Agent(Role::Pm));
        assert_eq!(last.slice.state, SliceState::Pm);
        assert!(last.run.error.as_deref().unwrap().contains("LLM"));
    }

    #[tokio::test]
    async fn abandon_releases_worktree_and_stops_scheduling() {
        let f = fixture();
        let p = pipeline(&f, Arc::new(ScriptedClient::new(vec![])), vec![]);
        let cancel = CancellationToken::new();
        p.step(f.slice.id, &cancel).await.unwrap();
        p.step(f.slice.id, &cancel).await.unwrap();
        let path = p.worktrees().worktree_path(f.project.id, f.slice.id);
        assert!(path.exists());

        let slice = p
            .human_event(f.slice.id, Event::Abandon, "alice")
            .await
            .unwrap();
        assert_eq!(slice.state, SliceState::Abandoned);
        assert!(!path.exists());
        assert!(p.step(f.slice.id, &cancel).await.unwrap().is_none());
    }
}
