//! Slice lifecycle state machine.
//!
//! ```text
//! draft ──context──> context_ready ──prepare──> pm ──> architect ──> dev ──> qa ──> ops
//!                                                                                   │
//!                                          ops ──ops ok──> ops (gates due) ──gates──┤
//!                                                                                   v
//!                                                                      ci_passed | ci_failed
//! any step failure/error ──> ci_failed ──remediate──> state of the failed step (gates -> dev)
//! any state except abandoned ──abandon──> abandoned
//! ```
//!
//! [`next_state`] is the pure, total transition table. [`SliceStateMachine`]
//! applies it against the database and audits every attempt, accepted or not.

use std::fmt;

use anyhow::Result;
use serde_json::json;

use super::db::{DbHandle, TransitionWrite};
use super::models::{Role, RunFinal, RunStatus, Slice, SliceState, Step, StepOutcome};
use crate::audit::{Actor, AuditLog, NewAuditEntry};
use crate::errors::SliceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A lifecycle step finished with the given outcome.
    Completed { step: Step, outcome: StepOutcome },
    /// Human request to retry the step that failed.
    Remediate,
    /// Human request to stop work on the slice.
    Abandon,
}

impl Event {
    pub fn succeeded(step: Step) -> Self {
        Self::Completed {
            step,
            outcome: StepOutcome::Success,
        }
    }

    pub fn failed(step: Step) -> Self {
        Self::Completed {
            step,
            outcome: StepOutcome::Failure,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Completed { step, outcome } => write!(f, "{}:{}", step, outcome.as_str()),
            Event::Remediate => f.write_str("remediate"),
            Event::Abandon => f.write_str("abandon"),
        }
    }
}

/// Result of a legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SliceState,
    pub to: SliceState,
    /// Recorded when entering `ci_failed`; cleared otherwise.
    pub failed_step: Option<Step>,
}

/// Steps whose completion is legal in `state`.
pub fn legal_steps(state: SliceState) -> &'static [Step] {
    match state {
        SliceState::Draft => &[Step::Context],
        SliceState::ContextReady => &[Step::Prepare],
        SliceState::Pm => &[Step::Agent(Role::Pm)],
        SliceState::Architect => &[Step::Agent(Role::Architect)],
        SliceState::Dev => &[Step::Agent(Role::Dev)],
        SliceState::Qa => &[Step::Agent(Role::Qa)],
        SliceState::Ops => &[Step::Agent(Role::Ops), Step::Gates],
        SliceState::CiPassed | SliceState::CiFailed | SliceState::Abandoned => &[],
    }
}

/// The state a remediation re-enters for a given failed step.
pub fn remediation_target(failed_step: Option<Step>) -> SliceState {
    match failed_step {
        Some(Step::Context) => SliceState::Draft,
        Some(Step::Prepare) => SliceState::ContextReady,
        Some(Step::Agent(Role::Pm)) => SliceState::Pm,
        Some(Step::Agent(Role::Architect)) => SliceState::Architect,
        Some(Step::Agent(Role::Dev)) => SliceState::Dev,
        Some(Step::Agent(Role::Qa)) => SliceState::Qa,
        Some(Step::Agent(Role::Ops)) => SliceState::Ops,
        Some(Step::Gates) | None => SliceState::Dev,
    }
}

fn success_target(step: Step) -> SliceState {
    match step {
        Step::Context => SliceState::ContextReady,
        Step::Prepare => SliceState::Pm,
        Step::Agent(Role::Pm) => SliceState::Architect,
        Step::Agent(Role::Architect) => SliceState::Dev,
        Step::Agent(Role::Dev) => SliceState::Qa,
        Step::Agent(Role::Qa) => SliceState::Ops,
        Step::Agent(Role::Ops) => SliceState::Ops,
        Step::Gates => SliceState::CiPassed,
    }
}

/// The transition table. Deterministic; every pair either maps to exactly
/// one next state or is rejected with `InvalidTransition`.
pub fn next_state(
    state: SliceState,
    failed_step: Option<Step>,
    event: Event,
) -> Result<Transition, SliceError> {
    let reject = || SliceError::InvalidTransition {
        from: state.as_str().to_string(),
        event: event.to_string(),
    };
    let (to, failed_step) = match event {
        Event::Abandon if state != SliceState::Abandoned => (SliceState::Abandoned, None),
        Event::Abandon => return Err(reject()),
        Event::Remediate if state == SliceState::CiFailed => {
            (remediation_target(failed_step), None)
        }
        Event::Remediate => return Err(reject()),
        Event::Completed { step, outcome } => {
            if !legal_steps(state).contains(&step) {
                return Err(reject());
            }
            match outcome {
                StepOutcome::Success => (success_target(step), None),
                StepOutcome::Failure | StepOutcome::Error => (SliceState::CiFailed, Some(step)),
            }
        }
    };
    Ok(Transition {
        from: state,
        to,
        failed_step,
    })
}

/// Applies events to persisted slices.
#[derive(Clone)]
pub struct SliceStateMachine {
    db: DbHandle,
    audit: AuditLog,
}

impl SliceStateMachine {
    pub fn new(db: DbHandle, audit: AuditLog) -> Self {
        Self { db, audit }
    }

    /// Advance `slice` by `event`.
    ///
    /// The state write is optimistic on the slice's state and version; the
    /// optional Run finalization and the audit entry share its transaction.
    /// A rejected event is audited, finalizes the Run on its own and returns
    /// `InvalidTransition` with the slice unchanged.
    pub async fn advance(
        &self,
        slice: &Slice,
        event: Event,
        actor: Actor,
        run: Option<(i64, RunFinal)>,
    ) -> Result<Slice> {
        let transition = match next_state(slice.state, slice.failed_step, event) {
            Ok(transition) => transition,
            Err(err) => {
                tracing::warn!(slice_id = slice.id, state = %slice.state, %event, "rejected transition");
                self.audit
                    .record_best_effort(
                        NewAuditEntry::slice(actor, "slice.transition_rejected", slice.id)
                            .with_payload(json!({
                                "from": slice.state.as_str(),
                                "event": event.to_string(),
                                "reason": err.to_string(),
                            })),
                    )
                    .await;
                if let Some((run_id, fin)) = run {
                    self.db.call(move |db| db.finalize_run(run_id, &fin)).await?;
                }
                return Err(err.into());
            }
        };

        let write = TransitionWrite {
            slice_id: slice.id,
            expected_state: slice.state,
            expected_version: slice.version,
            next_state: transition.to,
            failed_step: transition.failed_step,
            run: run.clone(),
            audit: NewAuditEntry::slice(actor.clone(), "slice.transition", slice.id).with_payload(
                json!({
                    "from": transition.from.as_str(),
                    "to": transition.to.as_str(),
                    "event": event.to_string(),
                    "run_id": run.as_ref().map(|(id, _)| *id),
                    "failed_step": transition.failed_step.map(|s| s.as_str()),
                }),
            ),
        };
        let result = self.db.call(move |db| db.apply_transition(&write)).await;
        match result {
            Ok(updated) => {
                tracing::info!(
                    slice_id = slice.id,
                    from = %transition.from,
                    to = %transition.to,
                    %event,
                    "slice transition"
                );
                Ok(updated)
            }
            Err(err) => {
                if let Some(SliceError::ConcurrentModification { .. }) =
                    err.downcast_ref::<SliceError>()
                {
                    self.audit
                        .record_best_effort(
                            NewAuditEntry::slice(actor, "slice.concurrent_modification", slice.id)
                                .with_payload(json!({
                                    "expected_state": slice.state.as_str(),
                                    "expected_version": slice.version,
                                    "event": event.to_string(),
                                })),
                        )
                        .await;
                    // The Run is superseded, not lost: finalize it outside the
                    // rolled-back transaction.
                    if let Some((run_id, fin)) = run {
                        let fin = RunFinal {
                            status: Some(RunStatus::Cancelled),
                            ..fin
                        }
                        .with_error("superseded: concurrent modification of slice");
                        self.db.call(move |db| db.finalize_run(run_id, &fin)).await?;
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SubjectKind;
    use crate::engine::db::SliceDb;
    use crate::engine::models::{NewSlice, RiskLevel, RunKind};

    fn all_events() -> Vec<Event> {
        let steps = [
            Step::Context,
            Step::Prepare,
            Step::Agent(Role::Pm),
            Step::Agent(Role::Architect),
            Step::Agent(Role::Dev),
            Step::Agent(Role::Qa),
            Step::Agent(Role::Ops),
            Step::Gates,
        ];
        let outcomes = [StepOutcome::Success, StepOutcome::Failure, StepOutcome::Error];
        let mut events = vec![Event::Remediate, Event::Abandon];
        for step in steps {
            for outcome in outcomes {
                events.push(Event::Completed { step, outcome });
            }
        }
        events
    }

    #[test]
    fn happy_path_reaches_ci_passed() {
        let path = [
            (SliceState::Draft, Step::Context, SliceState::ContextReady),
            (SliceState::ContextReady, Step::Prepare, SliceState::Pm),
            (SliceState::Pm, Step::Agent(Role::Pm), SliceState::Architect),
            (SliceState::Architect, Step::Agent(Role::Architect), SliceState::Dev),
            (SliceState::Dev, Step::Agent(Role::Dev), SliceState::Qa),
            (SliceState::Qa, Step::Agent(Role::Qa), SliceState::Ops),
            (SliceState::Ops, Step::Agent(Role::Ops), SliceState::Ops),
            (SliceState::Ops, Step::Gates, SliceState::CiPassed),
        ];
        for (from, step, to) in path {
            let t = next_state(from, None, Event::succeeded(step)).unwrap();
            assert_eq!(t.to, to, "{from} + {step}");
            assert_eq!(t.failed_step, None);
        }
    }

    #[test]
    fn qa_success_moves_to_ops_and_failure_to_ci_failed() {
        let ok = next_state(SliceState::Qa, None, Event::succeeded(Step::Agent(Role::Qa))).unwrap();
        assert_eq!(ok.to, SliceState::Ops);
        let failed = next_state(SliceState::Qa, None, Event::failed(Step::Agent(Role::Qa))).unwrap();
        assert_eq!(failed.to, SliceState::CiFailed);
        assert_eq!(failed.failed_step, Some(Step::Agent(Role::Qa)));
    }

    #[test]
    fn completion_from_wrong_state_is_invalid() {
        let err = next_state(SliceState::Draft, None, Event::succeeded(Step::Agent(Role::Qa)))
            .unwrap_err();
        assert!(matches!(err, SliceError::InvalidTransition { .. }));
        assert!(err.to_string().contains("draft"));
    }

    #[test]
    fn remediation_reenters_only_the_failed_step() {
        for (failed, expected) in [
            (Step::Agent(Role::Qa), SliceState::Qa),
            (Step::Agent(Role::Pm), SliceState::Pm),
            (Step::Context, SliceState::Draft),
            (Step::Gates, SliceState::Dev),
        ] {
            let t = next_state(SliceState::CiFailed, Some(failed), Event::Remediate).unwrap();
            assert_eq!(t.to, expected);
            assert_eq!(t.failed_step, None);
        }
        assert!(next_state(SliceState::Dev, None, Event::Remediate).is_err());
    }

    #[test]
    fn abandon_reachable_from_every_state_but_abandoned() {
        for state in SliceState::ALL {
            let result = next_state(state, None, Event::Abandon);
            if state == SliceState::Abandoned {
                assert!(result.is_err());
            } else {
                assert_eq!(result.unwrap().to, SliceState::Abandoned);
            }
        }
    }

    #[test]
    fn table_is_total_and_deterministic() {
        for state in SliceState::ALL {
            for failed in [None, Some(Step::Gates), Some(Step::Agent(Role::Dev))] {
                for event in all_events() {
                    let first = next_state(state, failed, event);
                    let second = next_state(state, failed, event);
                    match (first, second) {
                        (Ok(a), Ok(b)) => assert_eq!(a, b),
                        (Err(SliceError::InvalidTransition { .. }), Err(SliceError::InvalidTransition { .. })) => {}
                        other => panic!("non-deterministic or unexpected: {state} {event} {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing_but_abandon() {
        for event in all_events() {
            assert!(next_state(SliceState::Abandoned, None, event).is_err());
            let from_passed = next_state(SliceState::CiPassed, None, event);
            assert_eq!(from_passed.is_ok(), event == Event::Abandon);
        }
    }

    async fn machine_with_slice() -> (SliceStateMachine, DbHandle, Slice) {
        let db = DbHandle::new(SliceDb::new_in_memory().unwrap());
        let slice = db
            .call(|db| {
                let project = db.create_project("p", "https://github.com/o/r", "main", None)?;
                db.create_slice(&NewSlice {
                    project_id: project.id,
                    title: "t".into(),
                    scope: String::new(),
                    out_of_scope: String::new(),
                    risk_level: RiskLevel::Medium,
                    acceptance: vec![],
                })
            })
            .await
            .unwrap();
        let machine = SliceStateMachine::new(db.clone(), AuditLog::new(db.clone()));
        (machine, db, slice)
    }

    #[tokio::test]
    async fn advance_persists_and_audits() {
        let (machine, db, slice) = machine_with_slice().await;
        let run = db
            .call(move |db| db.create_run(slice.id, RunKind::Step(Step::Context)))
            .await
            .unwrap();
        let updated = machine
            .advance(
                &slice,
                Event::succeeded(Step::Context),
                Actor::system(),
                Some((run.id, RunFinal::new(RunStatus::Success))),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, SliceState::ContextReady);

        let slice_id = slice.id;
        let audit = db
            .call(move |db| db.list_audit(Some((SubjectKind::Slice, slice_id))))
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].payload["to"], "context_ready");
        assert_eq!(audit[0].payload["run_id"], run.id);
    }

    #[tokio::test]
    async fn rejected_transition_is_audited_and_state_unchanged() {
        let (machine, db, slice) = machine_with_slice().await;
        let err = machine
            .advance(&slice, Event::succeeded(Step::Agent(Role::Qa)), Actor::system(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SliceError>(),
            Some(SliceError::InvalidTransition { .. })
        ));
        let slice_id = slice.id;
        let (current, audit) = db
            .call(move |db| {
                Ok((
                    db.get_slice(slice_id)?,
                    db.list_audit(Some((SubjectKind::Slice, slice_id)))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(current.state, SliceState::Draft);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "slice.transition_rejected");
    }

    #[tokio::test]
    async fn stale_slice_fails_with_concurrent_modification() {
        let (machine, db, slice) = machine_with_slice().await;
        machine
            .advance(&slice, Event::succeeded(Step::Context), Actor::system(), None)
            .await
            .unwrap();
        let run = db
            .call(move |db| db.create_run(slice.id, RunKind::Step(Step::Context)))
            .await
            .unwrap();
        // `slice` still carries the draft snapshot.
        let err = machine
            .advance(
                &slice,
                Event::succeeded(Step::Context),
                Actor::system(),
                Some((run.id, RunFinal::new(RunStatus::Success))),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SliceError>(),
            Some(SliceError::ConcurrentModification { .. })
        ));
        let run_id = run.id;
        let stored = db.call(move |db| db.get_run(run_id)).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.error.unwrap().contains("superseded"));
    }
}
