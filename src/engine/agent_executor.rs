//! One role's generation step, materialised as a commit in the slice worktree.
//!
//! The generated file set is validated against the path ACL before anything
//! touches disk. A single denied path aborts the whole Run and leaves the
//! worktree untouched.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::acl::{PathAcl, normalize_path};
use super::context_pack::ContextBundle;
use super::llm::{Generation, GenerationClient, GenerationRequest, WriteMode};
use super::models::{Artifact, LlmConfig, Role, RunFinal, RunStatus, Slice, StepOutcome};
use super::quadrants::requirements_prompt;
use super::retry::{Retried, RetryPolicy, with_retry};
use super::text_blocks::upsert_block;
use super::worktree::{WorktreeHandle, WorktreeManager};
use crate::audit::{Actor, AuditLog, NewAuditEntry, SubjectKind};
use crate::errors::{GenerationError, SliceError, as_slice_error};
use crate::util::{clamp_text, sha256_hex};

/// Instruction and expected outputs for a role.
#[derive(Debug, Clone, Copy)]
pub struct RoleSpec {
    pub role: Role,
    pub instruction: &'static str,
    pub expected_outputs: &'static [&'static str],
}

pub fn role_spec(role: Role) -> RoleSpec {
    match role {
        Role::Pm => RoleSpec {
            role,
            instruction: "You are the product manager for this slice. Write the product \
                requirements and restate the acceptance criteria so they are testable.",
            expected_outputs: &["docs/PRD.md", "docs/ACCEPTANCE.md"],
        },
        Role::Architect => RoleSpec {
            role,
            instruction: "You are the architect for this slice. Describe the design and \
                update the API contract to match the requirements.",
            expected_outputs: &["docs/DESIGN.md", "contracts/openapi.yaml"],
        },
        Role::Dev => RoleSpec {
            role,
            instruction: "You are the developer for this slice. Implement the design with \
                unit tests and summarise the change in a report.",
            expected_outputs: &["src/", "reports/dev_report.md"],
        },
        Role::Qa => RoleSpec {
            role,
            instruction: "You are QA for this slice. Write tests that verify every \
                acceptance criterion and report the results.",
            expected_outputs: &["tests/", "reports/test_report.md"],
        },
        Role::Ops => RoleSpec {
            role,
            instruction: "You are operations for this slice. Document deployment and the \
                runbook, and report operational risks.",
            expected_outputs: &["docs/DEPLOY.md", "docs/RUNBOOK.md", "reports/ops_report.md"],
        },
    }
}

const OUTPUT_CONTRACT: &str = "Respond with a single JSON object: \
    {\"files\": [{\"path\": \"<repo-relative path>\", \"content\": \"<full file content>\", \
    \"mode\": \"replace\" | \"block\"}], \"rationale\": \"<why>\"}. \
    Only write under your allowed prefixes.";

/// Outcome of one step: the values to finalise the Run with, and the event
/// (if any) to feed the state machine.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub fin: RunFinal,
    pub event: Option<StepOutcome>,
}

impl StepReport {
    pub fn new(fin: RunFinal, event: Option<StepOutcome>) -> Self {
        Self { fin, event }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.fin = self.fin.with_attempts(attempts);
        self
    }

    /// A parked Run: finalised, no state change.
    pub fn parked(status: RunStatus, error: impl Into<String>) -> Self {
        Self {
            fin: RunFinal::new(status).with_error(error),
            event: None,
        }
    }
}

/// Per-call inputs of [`AgentExecutor::execute`].
pub struct AgentCall<'a> {
    pub slice: &'a Slice,
    pub role: Role,
    pub bundle: &'a ContextBundle,
    pub llm: LlmConfig,
    pub worktree: &'a WorktreeHandle,
    pub run_id: i64,
    pub cancel: &'a CancellationToken,
}

struct Snapshot {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

pub struct AgentExecutor {
    client: Arc<dyn GenerationClient>,
    worktrees: Arc<WorktreeManager>,
    acl: PathAcl,
    audit: AuditLog,
    retry: RetryPolicy,
}

impl AgentExecutor {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        worktrees: Arc<WorktreeManager>,
        acl: PathAcl,
        audit: AuditLog,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            worktrees,
            acl,
            audit,
            retry,
        }
    }

    pub async fn execute(&self, call: AgentCall<'_>) -> StepReport {
        let AgentCall {
            slice,
            role,
            bundle,
            llm,
            worktree,
            run_id,
            cancel,
        } = call;
        let spec = role_spec(role);
        let mut instruction = format!(
            "{}\nExpected outputs: {}.\n",
            spec.instruction,
            spec.expected_outputs.join(", ")
        );
        if let Some(quadrants) = &bundle.quadrants {
            let prompt = requirements_prompt(slice, quadrants, role);
            self.audit
                .record_best_effort(
                    NewAuditEntry::run(Actor::agent(role), "agent.requirements_prompt", run_id)
                        .with_payload(json!({"slice_id": slice.id, "prompt": prompt})),
                )
                .await;
            instruction.push_str(&prompt);
            instruction.push('\n');
        }
        instruction.push_str(OUTPUT_CONTRACT);
        let request = GenerationRequest {
            role,
            instruction,
            context: bundle.to_json(),
            config: llm,
        };

        let slice_id = slice.id;
        let client = &self.client;
        let audit = &self.audit;
        let req = &request;
        let retried = with_retry(
            &self.retry,
            cancel,
            GenerationError::is_transient,
            move |attempt| async move {
                let result = client.generate(req).await;
                let outcome = match &result {
                    Ok(_) => "ok".to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::debug!(run_id, %role, attempt, outcome = %outcome, "generation attempt");
                audit
                    .record_best_effort(
                        NewAuditEntry::new(
                            Actor::agent(role),
                            "agent.attempt",
                            SubjectKind::Run,
                            run_id,
                        )
                        .with_payload(json!({
                            "slice_id": slice_id,
                            "attempt": attempt,
                            "model": req.config.model,
                            "config_source": req.config.source.as_str(),
                            "outcome": outcome,
                        })),
                    )
                    .await;
                result
            },
        )
        .await;

        let (generation, attempts) = match retried {
            Retried::Ok { value, attempts } => (value, attempts),
            Retried::Cancelled { attempts } => {
                return StepReport::new(
                    RunFinal::new(RunStatus::Cancelled)
                        .with_attempts(attempts)
                        .with_error("cancelled between generation attempts"),
                    None,
                );
            }
            Retried::Failed { error, attempts } => {
                let transient = error.is_transient();
                let err = SliceError::Generation {
                    attempts,
                    source: error,
                };
                tracing::warn!(slice_id = slice.id, run_id, %role, error = %err, "generation failed");
                let (status, outcome) = if transient {
                    (RunStatus::Error, StepOutcome::Error)
                } else {
                    (RunStatus::Failure, StepOutcome::Failure)
                };
                return StepReport::new(
                    RunFinal::new(status)
                        .with_attempts(attempts)
                        .with_error(err.to_string()),
                    Some(outcome),
                );
            }
        };

        self.apply(slice, role, worktree, run_id, generation)
            .await
            .with_attempts(attempts)
    }

    /// Validate, write, commit. Attempts are filled in by the caller.
    async fn apply(
        &self,
        slice: &Slice,
        role: Role,
        worktree: &WorktreeHandle,
        run_id: i64,
        generation: Generation,
    ) -> StepReport {
        if let Err(denied) = self
            .acl
            .check_all(role, generation.files.iter().map(|f| f.path.as_str()))
        {
            let path = match &denied {
                SliceError::PathAccessDenied { path, .. } => path.clone(),
                _ => String::new(),
            };
            tracing::warn!(slice_id = slice.id, run_id, %role, path = %path, "path access denied");
            self.audit
                .record_best_effort(
                    NewAuditEntry::new(Actor::agent(role), "acl.denied", SubjectKind::Run, run_id)
                        .with_payload(json!({
                            "slice_id": slice.id,
                            "role": role.as_str(),
                            "path": path,
                            "requested": generation.files.iter().map(|f| &f.path).collect::<Vec<_>>(),
                            "security": true,
                        })),
                )
                .await;
            return StepReport::parked(RunStatus::Failure, denied.to_string());
        }

        let snapshots = match self.write_files(slice.id, worktree, &generation).await {
            Ok(snapshots) => snapshots,
            Err((snapshots, e)) => {
                restore(&snapshots).await;
                return StepReport::new(
                    RunFinal::new(RunStatus::Error)
                        .with_error(format!("Failed to write generated files: {:#}", e)),
                    Some(StepOutcome::Error),
                );
            }
        };

        let mut artifacts = Vec::new();
        for file in &generation.files {
            if let Some(rel) = normalize_path(&file.path)
                && let Ok(bytes) = tokio::fs::read(worktree.path.join(&rel)).await
            {
                artifacts.push(Artifact {
                    path: rel,
                    sha256: sha256_hex(&bytes),
                });
            }
        }

        let message = format!(
            "[{}] slice {}: {}\n\n{}\n\nRun-Id: {}",
            role,
            slice.id,
            slice.title,
            clamp_text(generation.rationale.trim(), 2000),
            run_id
        );
        let output = |commit: Option<&str>, note: Option<&str>| {
            json!({
                "rationale": generation.rationale,
                "files": artifacts.iter().map(|a| &a.path).collect::<Vec<_>>(),
                "commit": commit,
                "note": note,
            })
            .to_string()
        };

        match self.worktrees.commit(worktree, role, &self.acl, &message).await {
            Ok(commit) => StepReport::new(
                RunFinal::new(RunStatus::Success)
                    .with_output(output(Some(&commit.sha), None))
                    .with_commit(Some(commit.sha))
                    .with_artifacts(artifacts.clone()),
                Some(StepOutcome::Success),
            ),
            Err(e) => match as_slice_error(&e) {
                Some(SliceError::NothingToCommit { .. }) => {
                    tracing::info!(slice_id = slice.id, run_id, %role, "generation produced no changes");
                    StepReport::new(
                        RunFinal::new(RunStatus::Success)
                            .with_output(output(None, Some("nothing to commit")))
                            .with_artifacts(artifacts.clone()),
                        Some(StepOutcome::Success),
                    )
                }
                _ => {
                    restore(&snapshots).await;
                    tracing::error!(slice_id = slice.id, run_id, %role, error = %e, "commit failed");
                    StepReport::parked(RunStatus::Error, format!("{:#}", e))
                }
            },
        }
    }

    /// Write every file, remembering what was there before. On error the
    /// snapshots taken so far are returned for rollback.
    async fn write_files(
        &self,
        slice_id: i64,
        worktree: &WorktreeHandle,
        generation: &Generation,
    ) -> Result<Vec<Snapshot>, (Vec<Snapshot>, anyhow::Error)> {
        let mut snapshots = Vec::new();
        for file in &generation.files {
            let Some(rel) = normalize_path(&file.path) else {
                return Err((snapshots, anyhow::anyhow!("invalid path '{}'", file.path)));
            };
            let path = worktree.path.join(&rel);
            let previous = tokio::fs::read(&path).await.ok();
            snapshots.push(Snapshot {
                path: path.clone(),
                previous: previous.clone(),
            });

            let content = match file.mode {
                WriteMode::Replace => file.content.clone(),
                WriteMode::Block => {
                    let existing = previous
                        .as_deref()
                        .map(String::from_utf8_lossy)
                        .unwrap_or_default();
                    upsert_block(&existing, slice_id, &file.content)
                }
            };

            let written = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content.as_bytes()).await
            }
            .await;
            if let Err(e) = written {
                return Err((
                    snapshots,
                    anyhow::Error::new(e).context(format!("writing {}", rel)),
                ));
            }
        }
        Ok(snapshots)
    }
}

async fn restore(snapshots: &[Snapshot]) {
    for snap in snapshots.iter().rev() {
        let result = match &snap.previous {
            Some(bytes) => tokio::fs::write(&snap.path, bytes).await,
            None => match tokio::fs::remove_file(&snap.path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            tracing::error!(path = %snap.path.display(), error = %e, "failed to restore file");
        }
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::context_pack::build_context_pack;
    use crate::engine::llm::GeneratedFile;
    use crate::engine::models::{ConfigSource, RunKind, Step};
    use crate::engine::worktree::tests::{Fixture, fixture};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted responses, one per call.
    pub(crate) struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Generation, GenerationError>>>,
        pub calls: Mutex<u32>,
        pub instructions: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(responses: Vec<Result<Generation, GenerationError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
                instructions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn generate(&self, req: &GenerationRequest) -> Result<Generation, GenerationError> {
            *self.calls.lock().unwrap() += 1;
            self.instructions.lock().unwrap().push(req.instruction.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::Malformed("script exhausted".into())))
        }
    }

    pub(crate) fn files(entries: &[(&str, &str)]) -> Generation {
        Generation {
            files: entries
                .iter()
                .map(|(path, content)| GeneratedFile {
                    path: path.to_string(),
                    content: content.to_string(),
                    mode: WriteMode::Replace,
                })
                .collect(),
            rationale: "because".into(),
        }
    }

    pub(crate) fn llm() -> LlmConfig {
        LlmConfig {
            provider: "openai-compatible".into(),
            base_url: "http://localhost:1".into(),
            api_key: "sk-test".into(),
            model: "m".into(),
            temperature: 0.7,
            max_tokens: 256,
            source: ConfigSource::Global,
        }
    }

    pub(crate) fn default_acl() -> PathAcl {
        crate::config::SliceforgeToml::default().path_acl()
    }

    fn executor(f: &Fixture, client: Arc<ScriptedClient>) -> AgentExecutor {
        AgentExecutor::new(
            client,
            Arc::new(WorktreeManager::new(
                f.workspace.path().to_path_buf(),
                AuditLog::new(f.db.clone()),
            )),
            default_acl(),
            AuditLog::new(f.db.clone()),
            RetryPolicy::default()
                .with_delays(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    async fn run(
        f: &Fixture,
        exec: &AgentExecutor,
        role: Role,
        cancel: &CancellationToken,
    ) -> (StepReport, WorktreeHandle) {
        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        let bundle =
            build_context_pack(&handle.path, &f.slice, Some(role), &default_acl(), &[]).unwrap();
        let run = {
            let db = f.db.lock_sync().unwrap();
            db.create_run(f.slice.id, RunKind::Step(Step::Agent(role)))
                .unwrap()
        };
        let report = exec
            .execute(AgentCall {
                slice: &f.slice,
                role,
                bundle: &bundle,
                llm: llm(),
                worktree: &handle,
                run_id: run.id,
                cancel,
            })
            .await;
        (report, handle)
    }

    fn head(handle: &WorktreeHandle) -> String {
        let repo = git2::Repository::open(&handle.path).unwrap();
        repo.head().unwrap().peel_to_commit().unwrap().id().to_string()
    }

    #[tokio::test]
    async fn denied_path_aborts_whole_run_without_writes() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![Ok(files(&[
            ("src/app.py", "print('hi')\n"),
            ("docs/x.md", "not for dev\n"),
        ]))]));
        let exec = executor(&f, client);
        let before = {
            let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
            head(&handle)
        };

        let (report, handle) = run(&f, &exec, Role::Dev, &CancellationToken::new()).await;

        assert_eq!(report.event, None);
        assert_eq!(report.fin.status(), RunStatus::Failure);
        assert!(report.fin.error.as_deref().unwrap().contains("docs/x.md"));
        assert!(!handle.path.join("src/app.py").exists());
        assert!(!handle.path.join("docs/x.md").exists());
        assert_eq!(head(&handle), before);

        let audit = f.db.lock_sync().unwrap().list_audit(None).unwrap();
        assert!(audit.iter().any(|e| e.action == "acl.denied"));
    }

    #[tokio::test]
    async fn quadrant_directive_is_sent_and_audited() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(files(&[("src/app.py", "print('hi')\n")])),
            Ok(files(&[("src/app.py", "print('again')\n")])),
        ]));
        let exec = executor(&f, client.clone());
        let cancel = CancellationToken::new();

        let (plain, handle) = run(&f, &exec, Role::Dev, &cancel).await;
        assert_eq!(plain.event, Some(StepOutcome::Success));

        let bundle = build_context_pack(&handle.path, &f.slice, Some(Role::Dev), &default_acl(), &[])
            .unwrap()
            .with_quadrants(Some(crate::engine::models::Quadrants {
                semantic_contract: "Order totals never go negative".into(),
                ..Default::default()
            }));
        let run_id = {
            let db = f.db.lock_sync().unwrap();
            db.create_run(f.slice.id, RunKind::Step(Step::Agent(Role::Dev)))
                .unwrap()
                .id
        };
        let report = exec
            .execute(AgentCall {
                slice: &f.slice,
                role: Role::Dev,
                bundle: &bundle,
                llm: llm(),
                worktree: &handle,
                run_id,
                cancel: &cancel,
            })
            .await;
        assert_eq!(report.event, Some(StepOutcome::Success));

        let instructions = client.instructions.lock().unwrap().clone();
        assert!(!instructions[0].contains("Four-quadrant"));
        assert!(instructions[1].contains("### Semantic contract\nOrder totals never go negative"));
        assert!(instructions[1].contains("### Directive for dev"));
        assert!(instructions[1].ends_with(OUTPUT_CONTRACT));

        let audit = f
            .db
            .lock_sync()
            .unwrap()
            .list_audit(Some((SubjectKind::Run, run_id)))
            .unwrap();
        let sent = audit
            .iter()
            .find(|e| e.action == "agent.requirements_prompt")
            .unwrap();
        assert!(
            sent.payload["prompt"]
                .as_str()
                .unwrap()
                .contains("Directive for dev")
        );
    }

    #[tokio::test]
    async fn escaping_path_is_denied_not_malformed() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![Ok(files(&[
            ("src/app.py", "print('hi')\n"),
            ("../../etc/x", "payload\n"),
        ]))]));
        let exec = executor(&f, client);

        let (report, handle) = run(&f, &exec, Role::Dev, &CancellationToken::new()).await;

        assert_eq!(report.event, None);
        assert!(report.fin.error.as_deref().unwrap().contains("../../etc/x"));
        assert!(!handle.path.join("src/app.py").exists());
        let audit = f.db.lock_sync().unwrap().list_audit(None).unwrap();
        let denied = audit.iter().find(|e| e.action == "acl.denied").unwrap();
        assert_eq!(denied.payload["security"], true);
    }

    #[tokio::test]
    async fn allowed_files_are_committed_with_run_id() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![Ok(files(&[
            ("src/app.py", "print('hi')\n"),
            ("reports/dev_report.md", "done\n"),
        ]))]));
        let exec = executor(&f, client);

        let (report, handle) = run(&f, &exec, Role::Dev, &CancellationToken::new()).await;

        assert_eq!(report.event, Some(StepOutcome::Success));
        assert_eq!(report.fin.artifacts.len(), 2);
        assert_eq!(
            report.fin.artifacts[0].sha256,
            sha256_hex(b"print('hi')\n")
        );
        let sha = report.fin.commit_sha.clone().unwrap();
        assert_eq!(head(&handle), sha);
        let repo = git2::Repository::open(&handle.path).unwrap();
        let message = repo
            .find_commit(git2::Oid::from_str(&sha).unwrap())
            .unwrap()
            .message()
            .unwrap()
            .to_string();
        assert!(message.starts_with("[dev] slice"));
        assert!(message.contains("Run-Id: "));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_each_attempt_audited() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![
            Err(GenerationError::Timeout),
            Err(GenerationError::Transport("reset".into())),
            Ok(files(&[("docs/PRD.md", "# PRD\n")])),
        ]));
        let exec = executor(&f, client.clone());

        let (report, _) = run(&f, &exec, Role::Pm, &CancellationToken::new()).await;

        assert_eq!(report.event, Some(StepOutcome::Success));
        assert_eq!(report.fin.attempts, 3);
        assert_eq!(*client.calls.lock().unwrap(), 3);
        let audit = f.db.lock_sync().unwrap().list_audit(None).unwrap();
        assert_eq!(
            audit.iter().filter(|e| e.action == "agent.attempt").count(),
            3
        );
    }

    #[tokio::test]
    async fn exhausted_retries_finalise_as_error() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![
            Err(GenerationError::Timeout),
            Err(GenerationError::Timeout),
            Err(GenerationError::Timeout),
        ]));
        let exec = executor(&f, client);
        let (report, _) = run(&f, &exec, Role::Pm, &CancellationToken::new()).await;
        assert_eq!(report.fin.status(), RunStatus::Error);
        assert_eq!(report.event, Some(StepOutcome::Error));
        assert_eq!(report.fin.attempts, 3);
    }

    #[tokio::test]
    async fn malformed_response_is_a_hard_failure() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![Err(GenerationError::Malformed(
            "not json".into(),
        ))]));
        let exec = executor(&f, client.clone());
        let (report, _) = run(&f, &exec, Role::Pm, &CancellationToken::new()).await;
        assert_eq!(report.fin.status(), RunStatus::Failure);
        assert_eq!(*client.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let f = fixture();
        let client = Arc::new(ScriptedClient::new(vec![]));
        let exec = executor(&f, client.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (report, _) = run(&f, &exec, Role::Pm, &cancel).await;
        assert_eq!(report.fin.status(), RunStatus::Cancelled);
        assert_eq!(report.event, None);
        assert_eq!(*client.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn block_mode_preserves_other_content() {
        let f = fixture();
        let mut generation = files(&[("docs/PRD.md", "slice section")]);
        generation.files[0].mode = WriteMode::Block;
        let client = Arc::new(ScriptedClient::new(vec![Ok(generation)]));
        let exec = executor(&f, client);

        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        std::fs::create_dir_all(handle.path.join("docs")).unwrap();
        std::fs::write(handle.path.join("docs/PRD.md"), "# Shared PRD\n").unwrap();

        let (report, handle) = run(&f, &exec, Role::Pm, &CancellationToken::new()).await;
        assert_eq!(report.event, Some(StepOutcome::Success));
        let content = std::fs::read_to_string(handle.path.join("docs/PRD.md")).unwrap();
        assert!(content.starts_with("# Shared PRD\n"));
        assert!(content.contains(&format!("<!-- slice:{}:start -->", f.slice.id)));
    }

    #[test]
    fn every_role_has_a_catalogue_entry_within_its_default_prefixes() {
        let acl = default_acl();
        for role in Role::ALL {
            let spec = role_spec(role);
            assert_eq!(spec.role, role);
            for output in spec.expected_outputs {
                assert!(acl.is_allowed(role, output), "{role} -> {output}");
            }
        }
    }
}
