//! Quality gates: configured shell checks run inside a slice worktree.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::models::{GateFailure, GateResult, StepOutcome};
use crate::config::GateSpec;
use crate::errors::SliceError;
use crate::util::clamp_text;

/// Captured stdout/stderr are clamped to this many characters each.
pub const OUTPUT_LIMIT: usize = 15_000;

/// Results of one gates pass.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub results: Vec<GateResult>,
    pub cancelled: bool,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        !self.cancelled && self.results.iter().all(|r| r.passed)
    }

    /// `None` when the pass was cancelled. An unavailable check is an error;
    /// any other failing check is a failure.
    pub fn outcome(&self) -> Option<StepOutcome> {
        if self.cancelled {
            return None;
        }
        if self.passed() {
            Some(StepOutcome::Success)
        } else if self
            .results
            .iter()
            .any(|r| r.failure == Some(GateFailure::Unavailable))
        {
            Some(StepOutcome::Error)
        } else {
            Some(StepOutcome::Failure)
        }
    }

    /// Typed error for the first failing check.
    pub fn first_error(&self, gates: &[GateSpec]) -> Option<SliceError> {
        let failed = self.results.iter().find(|r| !r.passed)?;
        let err = match failed.failure? {
            GateFailure::Timeout => SliceError::GateTimeout {
                gate: failed.name.clone(),
                timeout_secs: gates
                    .iter()
                    .find(|g| g.name == failed.name)
                    .map(|g| g.timeout_secs)
                    .unwrap_or_default(),
            },
            GateFailure::CheckFailed => SliceError::GateCheckFailed {
                gate: failed.name.clone(),
                exit_code: failed.exit_code.unwrap_or(-1),
            },
            GateFailure::Unavailable => SliceError::GateUnavailable {
                gate: failed.name.clone(),
                reason: failed.stderr.clone(),
            },
            GateFailure::Cancelled => return None,
        };
        Some(err)
    }

    /// Markdown summary: one row per gate.
    pub fn summary(&self) -> String {
        let mut out = String::from("| Gate | Status |\n|------|--------|\n");
        for r in &self.results {
            let status = match r.failure {
                None => "passed".to_string(),
                Some(GateFailure::CheckFailed) => match r.exit_code {
                    Some(code) => format!("failed (exit {})", code),
                    None => "failed".to_string(),
                },
                Some(other) => other.as_str().replace('_', " "),
            };
            out.push_str(&format!("| {} | {} |\n", r.name, status));
        }
        out
    }
}

pub struct GateRunner {
    gates: Vec<GateSpec>,
}

impl GateRunner {
    pub fn new(gates: Vec<GateSpec>) -> Self {
        Self { gates }
    }

    pub fn gates(&self) -> &[GateSpec] {
        &self.gates
    }

    /// Run every gate in order. A failing gate does not stop the pass;
    /// cancellation does.
    pub async fn run(&self, worktree: &Path, cancel: &CancellationToken) -> GateReport {
        let mut report = GateReport::default();
        for gate in &self.gates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let result = run_gate(gate, worktree, cancel).await;
            tracing::info!(
                gate = %gate.name,
                passed = result.passed,
                failure = result.failure.map(|f| f.as_str()),
                duration_ms = result.duration_ms,
                "gate finished"
            );
            let was_cancelled = result.failure == Some(GateFailure::Cancelled);
            report.results.push(result);
            if was_cancelled {
                report.cancelled = true;
                break;
            }
        }
        report
    }
}

fn failed(
    gate: &GateSpec,
    failure: GateFailure,
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
    started: Instant,
) -> GateResult {
    GateResult {
        name: gate.name.clone(),
        passed: false,
        failure: Some(failure),
        exit_code,
        stdout: clamp_text(stdout, OUTPUT_LIMIT),
        stderr: clamp_text(stderr, OUTPUT_LIMIT),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Kill the gate's whole process group so grandchildren (`make`, test
/// runners) do not outlive the Run.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid
        && let Ok(pgid) = libc::pid_t::try_from(pgid)
    {
        // SAFETY: killpg only sends a signal; the group was created for this gate.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Run one gate in its own process group. The group is killed when the gate
/// times out or the pass is cancelled.
pub async fn run_gate(gate: &GateSpec, worktree: &Path, cancel: &CancellationToken) -> GateResult {
    let started = Instant::now();
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&gate.command)
        .current_dir(worktree)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let child = command.spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return failed(
                gate,
                GateFailure::Unavailable,
                None,
                "",
                &format!("failed to start: {}", e),
                started,
            );
        }
    };

    let pgid = child.id();
    let waited = tokio::select! {
        _ = cancel.cancelled() => None,
        r = tokio::time::timeout(gate.timeout(), child.wait_with_output()) => Some(r),
    };
    if !matches!(waited, Some(Ok(_))) {
        kill_group(pgid);
    }

    match waited {
        None => failed(gate, GateFailure::Cancelled, None, "", "cancelled", started),
        Some(Err(_)) => failed(
            gate,
            GateFailure::Timeout,
            None,
            "",
            &format!("timed out after {}s", gate.timeout_secs),
            started,
        ),
        Some(Ok(Err(e))) => failed(
            gate,
            GateFailure::Unavailable,
            None,
            "",
            &format!("failed to wait: {}", e),
            started,
        ),
        Some(Ok(Ok(output))) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            match output.status.code() {
                Some(0) => GateResult {
                    name: gate.name.clone(),
                    passed: true,
                    failure: None,
                    exit_code: Some(0),
                    stdout: clamp_text(&stdout, OUTPUT_LIMIT),
                    stderr: clamp_text(&stderr, OUTPUT_LIMIT),
                    duration_ms: started.elapsed().as_millis() as u64,
                },
                // sh: command not found / not executable
                Some(code @ (126 | 127)) => failed(
                    gate,
                    GateFailure::Unavailable,
                    Some(code),
                    &stdout,
                    &stderr,
                    started,
                ),
                code => failed(gate, GateFailure::CheckFailed, code, &stdout, &stderr, started),
            }
        }
    }
}
