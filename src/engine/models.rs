use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent capability. Closed set; each role is confined to its path prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pm,
    Architect,
    Dev,
    Qa,
    Ops,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Pm, Role::Architect, Role::Dev, Role::Qa, Role::Ops];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Architect => "architect",
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Ops => "ops",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(Self::Pm),
            "architect" => Ok(Self::Architect),
            "dev" => Ok(Self::Dev),
            "qa" => Ok(Self::Qa),
            "ops" => Ok(Self::Ops),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a slice. Agent states name the step that is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceState {
    Draft,
    ContextReady,
    Pm,
    Architect,
    Dev,
    Qa,
    Ops,
    CiPassed,
    CiFailed,
    Abandoned,
}

impl SliceState {
    pub const ALL: [SliceState; 10] = [
        SliceState::Draft,
        SliceState::ContextReady,
        SliceState::Pm,
        SliceState::Architect,
        SliceState::Dev,
        SliceState::Qa,
        SliceState::Ops,
        SliceState::CiPassed,
        SliceState::CiFailed,
        SliceState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::ContextReady => "context_ready",
            Self::Pm => "pm",
            Self::Architect => "architect",
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Ops => "ops",
            Self::CiPassed => "ci_passed",
            Self::CiFailed => "ci_failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// No automated step runs from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CiPassed | Self::Abandoned)
    }

    /// States from which the scheduler has a step to dispatch.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::CiFailed
    }

    /// The agent role whose step is due in this state, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Pm => Some(Role::Pm),
            Self::Architect => Some(Role::Architect),
            Self::Dev => Some(Role::Dev),
            Self::Qa => Some(Role::Qa),
            Self::Ops => Some(Role::Ops),
            _ => None,
        }
    }
}

impl FromStr for SliceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SliceState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid slice state: {}", s))
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle step. Each completion feeds one event into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Context,
    Prepare,
    Agent(Role),
    Gates,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Prepare => "prepare",
            Self::Agent(role) => role.as_str(),
            Self::Gates => "gates",
        }
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(Self::Context),
            "prepare" => Ok(Self::Prepare),
            "gates" => Ok(Self::Gates),
            other => other
                .parse::<Role>()
                .map(Self::Agent)
                .map_err(|_| format!("Invalid step: {}", s)),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a Run executed: a lifecycle step or a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Step(Step),
    Publish,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step(step) => step.as_str(),
            Self::Publish => "publish",
        }
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "publish" {
            Ok(Self::Publish)
        } else {
            s.parse::<Step>().map(Self::Step)
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported to the state machine for a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Error,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_final(&self) -> bool {
        *self != Self::Running
    }

    /// Event outcome for the state machine; `None` for non-final or cancelled runs.
    pub fn step_outcome(&self) -> Option<StepOutcome> {
        match self {
            Self::Success => Some(StepOutcome::Success),
            Self::Failure => Some(StepOutcome::Failure),
            Self::Error => Some(StepOutcome::Error),
            Self::Running | Self::Cancelled => None,
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid risk level: {}", s)),
        }
    }
}

/// Project-level authorization. Distinct from agent [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

impl FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "member" => Ok(Self::Member),
            _ => Err(format!("Invalid member role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_url: String,
    pub default_branch: String,
    /// `owner/repo` on the PR host; derived from `repo_url` when absent.
    pub github_repo: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub project_id: i64,
    pub user_id: String,
    pub role: MemberRole,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub code: String,
    pub text: String,
    #[serde(default)]
    pub verification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub scope: String,
    pub out_of_scope: String,
    pub risk_level: RiskLevel,
    pub acceptance: Vec<AcceptanceCriterion>,
    pub branch_name: String,
    pub state: SliceState,
    /// Step that moved the slice into `ci_failed`.
    pub failed_step: Option<Step>,
    pub version: i64,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields supplied by a human when drafting a slice.
#[derive(Debug, Clone)]
pub struct NewSlice {
    pub project_id: i64,
    pub title: String,
    pub scope: String,
    pub out_of_scope: String,
    pub risk_level: RiskLevel,
    pub acceptance: Vec<AcceptanceCriterion>,
}

/// A file produced by a Run, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub slice_id: i64,
    pub kind: RunKind,
    pub status: RunStatus,
    pub attempts: u32,
    pub output: String,
    pub error: Option<String>,
    pub commit_sha: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// Finalised without feeding the state machine; the step stays due.
    pub parked: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Final values written to a Run row exactly once.
#[derive(Debug, Clone, Default)]
pub struct RunFinal {
    pub status: Option<RunStatus>,
    pub attempts: u32,
    pub output: String,
    pub error: Option<String>,
    pub commit_sha: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub parked: bool,
}

impl RunFinal {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_commit(mut self, sha: Option<String>) -> Self {
        self.commit_sha = sha;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn parked(mut self) -> Self {
        self.parked = true;
        self
    }

    pub fn status(&self) -> RunStatus {
        self.status.unwrap_or(RunStatus::Error)
    }
}

/// Why a gate check did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFailure {
    CheckFailed,
    Timeout,
    Unavailable,
    Cancelled,
}

impl GateFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckFailed => "check_failed",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for GateFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_failed" => Ok(Self::CheckFailed),
            "timeout" => Ok(Self::Timeout),
            "unavailable" => Ok(Self::Unavailable),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid gate failure: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub failure: Option<GateFailure>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Which override layer supplied an LLM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Global,
    Project,
    User,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

/// One stored layer of generation settings. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl LlmSettings {
    /// A layer is usable when endpoint, credential and model are all present.
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.model.trim().is_empty()
    }
}

/// Generation configuration resolved for a single Run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub source: ConfigSource,
}

/// Requirements of a slice in four quadrants. Blank text is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quadrants {
    #[serde(default)]
    pub functional_core: String,
    #[serde(default)]
    pub physical_constraints: String,
    #[serde(default)]
    pub semantic_contract: String,
    #[serde(default)]
    pub exceptions: String,
}

impl Quadrants {
    pub fn is_empty(&self) -> bool {
        [
            &self.functional_core,
            &self.physical_constraints,
            &self.semantic_contract,
            &self.exceptions,
        ]
        .iter()
        .all(|text| text.trim().is_empty())
    }

    /// Take every quadrant that `other` sets; keep the rest.
    pub fn merge(&mut self, other: Quadrants) {
        fn take(slot: &mut String, value: String) {
            if !value.trim().is_empty() {
                *slot = value;
            }
        }
        take(&mut self.functional_core, other.functional_core);
        take(&mut self.physical_constraints, other.physical_constraints);
        take(&mut self.semantic_contract, other.semantic_contract);
        take(&mut self.exceptions, other.exceptions);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCategory {
    Functional,
    Physical,
    Semantic,
    Exception,
}

impl TraceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::Physical => "physical",
            Self::Semantic => "semantic",
            Self::Exception => "exception",
        }
    }

    /// Prefix of the item codes in this category, e.g. `SC` in `SC-003`.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            Self::Functional => "FC",
            Self::Physical => "PC",
            Self::Semantic => "SC",
            Self::Exception => "EX",
        }
    }
}

impl FromStr for TraceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "functional" => Ok(Self::Functional),
            "physical" => Ok(Self::Physical),
            "semantic" => Ok(Self::Semantic),
            "exception" => Ok(Self::Exception),
            _ => Err(format!("Invalid trace category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Pending,
    NeedsAudit,
    Compliant,
    NonCompliant,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NeedsAudit => "needs_audit",
            Self::Compliant => "compliant",
            Self::NonCompliant => "non_compliant",
        }
    }
}

impl FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "needs_audit" => Ok(Self::NeedsAudit),
            "compliant" => Ok(Self::Compliant),
            "non_compliant" => Ok(Self::NonCompliant),
            _ => Err(format!("Invalid trace status: {}", s)),
        }
    }
}

/// A requirement derived from the quadrants, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTraceItem {
    pub code: String,
    pub category: TraceCategory,
    pub text: String,
}

/// A requirement followed from quadrant text to the files that realise it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceItem {
    pub id: i64,
    pub slice_id: i64,
    pub code: String,
    pub category: TraceCategory,
    pub text: String,
    pub target_files: Vec<String>,
    pub commit_sha: Option<String>,
    pub status: TraceStatus,
    pub notes: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub code: String,
    pub text: String,
    pub passed: bool,
    pub snippet: Option<String>,
    pub note: String,
}

/// Result of auditing every trace item of a slice against its worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    pub id: i64,
    pub slice_id: i64,
    pub run_id: Option<i64>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Percentage of items that passed.
    pub coverage: f64,
    pub findings: Vec<AuditFinding>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLayer {
    Base,
    Contract,
    Slot,
    Protection,
}

impl ControlLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Contract => "contract",
            Self::Slot => "slot",
            Self::Protection => "protection",
        }
    }
}

impl FromStr for ControlLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Self::Base),
            "contract" => Ok(Self::Contract),
            "slot" => Ok(Self::Slot),
            "protection" => Ok(Self::Protection),
            _ => Err(format!("Invalid control layer: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Pending,
    Verified,
    Failed,
}

impl ControlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ControlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid control status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewControlItem {
    pub layer: ControlLayer,
    pub item: String,
    pub source: String,
    pub tracking: String,
    pub acceptance: String,
}

/// One row of a slice's control table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlItem {
    pub id: i64,
    pub slice_id: i64,
    pub layer: ControlLayer,
    pub item: String,
    pub source: String,
    pub tracking: String,
    pub acceptance: String,
    pub status: ControlStatus,
    pub updated_by: Option<String>,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_state_round_trips_through_str() {
        for state in SliceState::ALL {
            assert_eq!(state.as_str().parse::<SliceState>().unwrap(), state);
        }
        assert!("shipping".parse::<SliceState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(SliceState::CiPassed.is_terminal());
        assert!(SliceState::Abandoned.is_terminal());
        assert!(!SliceState::CiFailed.is_terminal());
        assert!(!SliceState::CiFailed.is_active());
        assert!(SliceState::Draft.is_active());
    }

    #[test]
    fn step_parses_roles_and_fixed_steps() {
        assert_eq!("dev".parse::<Step>().unwrap(), Step::Agent(Role::Dev));
        assert_eq!("gates".parse::<Step>().unwrap(), Step::Gates);
        assert_eq!("publish".parse::<RunKind>().unwrap(), RunKind::Publish);
        assert_eq!(
            "context".parse::<RunKind>().unwrap(),
            RunKind::Step(Step::Context)
        );
        assert!("deploy".parse::<Step>().is_err());
    }

    #[test]
    fn cancelled_runs_produce_no_event() {
        assert_eq!(RunStatus::Cancelled.step_outcome(), None);
        assert_eq!(RunStatus::Running.step_outcome(), None);
        assert_eq!(
            RunStatus::Failure.step_outcome(),
            Some(StepOutcome::Failure)
        );
    }

    #[test]
    fn llm_settings_completeness_ignores_whitespace() {
        let mut settings = LlmSettings {
            base_url: "https://api.example.com/v1".into(),
            api_key: "   ".into(),
            model: "m".into(),
            ..Default::default()
        };
        assert!(!settings.is_complete());
        settings.api_key = "sk-1234".into();
        assert!(settings.is_complete());
    }

    #[test]
    fn quadrant_merge_keeps_unset_fields() {
        let mut q = Quadrants {
            functional_core: "Checkout".into(),
            exceptions: "Card declined".into(),
            ..Default::default()
        };
        assert!(!q.is_empty());
        q.merge(Quadrants {
            functional_core: "Checkout with coupons".into(),
            exceptions: "  ".into(),
            ..Default::default()
        });
        assert_eq!(q.functional_core, "Checkout with coupons");
        assert_eq!(q.exceptions, "Card declined");
        assert!(Quadrants::default().is_empty());
        assert_eq!(
            "needs_audit".parse::<TraceStatus>().unwrap(),
            TraceStatus::NeedsAudit
        );
    }
}
