use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{FailureKind, FlowError};
use crate::flow::context::LoginStatus;

/// Protocol step identifiers, in canonical execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepId {
    InitiateLogin,
    FollowToAuthChallenge,
    Authenticate,
    ResolveConsent,
    CompleteCallback,
    QueryLoginStatus,
    DecodeToken,
}

impl StepId {
    pub const ALL: [StepId; 7] = [
        StepId::InitiateLogin,
        StepId::FollowToAuthChallenge,
        StepId::Authenticate,
        StepId::ResolveConsent,
        StepId::CompleteCallback,
        StepId::QueryLoginStatus,
        StepId::DecodeToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::InitiateLogin => "initiate-login",
            StepId::FollowToAuthChallenge => "follow-to-auth-challenge",
            StepId::Authenticate => "authenticate",
            StepId::ResolveConsent => "resolve-consent",
            StepId::CompleteCallback => "complete-callback",
            StepId::QueryLoginStatus => "query-login-status",
            StepId::DecodeToken => "decode-token",
        }
    }
}

/// Data a successful step hands to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    /// Nothing beyond "it worked"
    None,
    /// A redirect target to continue from (consent URL after first factor)
    Redirect(String),
    /// Authorization code and anti-CSRF state
    Code { code: String, state: String },
    /// Parsed login-status fields
    LoginStatus(LoginStatus),
    /// Decoded JWT claims
    Claims(serde_json::Value),
}

/// Result of driving one protocol step. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(StepPayload),
    Redirect { location: String, status: u16 },
    ConsentRequired { flow_id: String },
    ReauthRequired,
    Failure(FlowError),
}

/// Orchestrator state machine phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FlowPhase {
    Init,
    LoginInitiated,
    ConsentPending,
    Authenticated,
    CodeObtained,
    CallbackCompleted,
    StatusVerified,
    Done,
}

/// Verdict for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepVerdict {
    Pending,
    Pass,
    Warn { reason: String },
    Skip { reason: String },
    Fail { kind: FailureKind, error: String },
}

impl StepVerdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepVerdict::Pending)
    }
}

/// Execution state for a single protocol step.
#[derive(Debug, Clone)]
pub struct StepState {
    pub step: StepId,
    pub verdict: StepVerdict,
    pub message: Option<String>,
    pub started_at: Option<Instant>,
    pub duration_ms: Option<u64>,
}

impl StepState {
    pub fn new(step: StepId) -> Self {
        Self {
            step,
            verdict: StepVerdict::Pending,
            message: None,
            started_at: None,
            duration_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn pass(&mut self, message: Option<String>) {
        self.message = message;
        self.finish(StepVerdict::Pass);
    }

    pub fn warn(&mut self, reason: String) {
        self.finish(StepVerdict::Warn { reason });
    }

    pub fn fail(&mut self, error: &FlowError) {
        self.finish(StepVerdict::Fail {
            kind: error.kind(),
            error: error.to_string(),
        });
    }

    pub fn skip(&mut self, reason: String) {
        self.verdict = StepVerdict::Skip { reason };
    }

    fn finish(&mut self, verdict: StepVerdict) {
        self.verdict = verdict;
        if let Some(start) = self.started_at {
            self.duration_ms = Some(start.elapsed().as_millis() as u64);
        }
    }

    pub fn to_report(&self) -> StepRecord {
        StepRecord {
            step: self.step,
            name: self.step.as_str().to_string(),
            verdict: self.verdict.clone(),
            message: self.message.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Serializable mirror of `StepState` (without `Instant`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: StepId,
    pub name: String,
    pub verdict: StepVerdict,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
}

/// State for one scenario run (fresh login, SSO seed, SSO reuse).
#[derive(Debug, Clone)]
pub struct ScenarioState {
    pub name: String,
    pub phase: FlowPhase,
    pub steps: Vec<StepState>,
    /// Which branch `FollowToAuthChallenge` actually took, once known
    pub branch: Option<String>,
    /// Free-form judgments attached to the scenario (cookie sharing etc.)
    pub notes: Vec<String>,
    pub started_at: Option<Instant>,
    pub duration_ms: Option<u64>,
}

impl ScenarioState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: FlowPhase::Init,
            steps: StepId::ALL.iter().map(|s| StepState::new(*s)).collect(),
            branch: None,
            notes: Vec::new(),
            started_at: None,
            duration_ms: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stops the clock; the phase keeps whatever terminal state the
    /// orchestrator reached, which the report surfaces as-is.
    pub fn finish(&mut self) {
        if let Some(start) = self.started_at {
            self.duration_ms = Some(start.elapsed().as_millis() as u64);
        }
    }

    pub fn step_mut(&mut self, step: StepId) -> &mut StepState {
        self.steps
            .iter_mut()
            .find(|s| s.step == step)
            .expect("every StepId is pre-created")
    }

    /// Mark every step that never ran as skipped.
    pub fn skip_remaining(&mut self, reason: &str) {
        for step in &mut self.steps {
            if matches!(step.verdict, StepVerdict::Pending) {
                step.skip(reason.to_string());
            }
        }
    }

    pub fn has_failure(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.verdict, StepVerdict::Fail { .. }))
    }

    pub fn to_report(&self) -> ScenarioReport {
        ScenarioReport {
            name: self.name.clone(),
            phase: self.phase,
            branch: self.branch.clone(),
            notes: self.notes.clone(),
            steps: self.steps.iter().map(|s| s.to_report()).collect(),
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub phase: FlowPhase,
    pub branch: Option<String>,
    pub notes: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub duration_ms: Option<u64>,
}

/// Overall run verdict: Fail if any step failed, Warn if any warned, else Pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunVerdict {
    Pass,
    Warn,
    Fail,
}

/// Global state for one invocation (one or more scenarios).
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub scenarios: Vec<ScenarioState>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl RunState {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            scenarios: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn add_scenario(&mut self, scenario: ScenarioState) {
        self.scenarios.push(scenario);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    pub fn overall(&self) -> RunVerdict {
        let mut verdict = RunVerdict::Pass;
        for scenario in &self.scenarios {
            for step in &scenario.steps {
                match step.verdict {
                    StepVerdict::Fail { .. } => return RunVerdict::Fail,
                    StepVerdict::Warn { .. } => verdict = RunVerdict::Warn,
                    _ => {}
                }
            }
        }
        verdict
    }

    /// True when every recorded failure is a policy failure; drives the
    /// reserved exit code 2.
    pub fn failures_all_policy(&self) -> bool {
        let mut saw_failure = false;
        for scenario in &self.scenarios {
            for step in &scenario.steps {
                if let StepVerdict::Fail { kind, .. } = step.verdict {
                    saw_failure = true;
                    if kind != FailureKind::Policy {
                        return false;
                    }
                }
            }
        }
        saw_failure
    }

    pub fn summary(&self) -> RunSummary {
        let mut total = 0;
        let mut passed = 0;
        let mut failed = 0;
        let mut warned = 0;
        let mut skipped = 0;

        for scenario in &self.scenarios {
            for step in &scenario.steps {
                total += 1;
                match step.verdict {
                    StepVerdict::Pass => passed += 1,
                    StepVerdict::Fail { .. } => failed += 1,
                    StepVerdict::Warn { .. } => warned += 1,
                    StepVerdict::Skip { .. } => skipped += 1,
                    StepVerdict::Pending => {}
                }
            }
        }

        let total_duration_ms = self.started_at.map(|start| {
            self.finished_at
                .unwrap_or_else(Instant::now)
                .duration_since(start)
                .as_millis() as u64
        });

        RunSummary {
            run_id: self.run_id.clone(),
            total_scenarios: self.scenarios.len() as u32,
            total_steps: total,
            passed,
            failed,
            warned,
            skipped,
            verdict: self.overall(),
            total_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub total_scenarios: u32,
    pub total_steps: u32,
    pub passed: u32,
    pub failed: u32,
    pub warned: u32,
    pub skipped: u32,
    pub verdict: RunVerdict,
    pub total_duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_fail_beats_warn() {
        let mut run = RunState::new("r1");
        let mut scenario = ScenarioState::new("fresh");
        scenario.step_mut(StepId::InitiateLogin).pass(None);
        scenario
            .step_mut(StepId::FollowToAuthChallenge)
            .warn("no code observed".into());
        scenario
            .step_mut(StepId::Authenticate)
            .fail(&FlowError::Authentication("status deny".into()));
        scenario.skip_remaining("earlier step failed");
        run.add_scenario(scenario);

        assert_eq!(run.overall(), RunVerdict::Fail);
        let summary = run.summary();
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.warned, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 4);
    }

    #[test]
    fn test_overall_warn_without_failures() {
        let mut run = RunState::new("r1");
        let mut scenario = ScenarioState::new("sso-reuse");
        for step in StepId::ALL {
            scenario.step_mut(step).pass(None);
        }
        scenario
            .step_mut(StepId::DecodeToken)
            .warn("undecodable".into());
        run.add_scenario(scenario);
        assert_eq!(run.overall(), RunVerdict::Warn);
    }

    #[test]
    fn test_failures_all_policy_detection() {
        let mut run = RunState::new("r1");
        let mut scenario = ScenarioState::new("fresh");
        scenario
            .step_mut(StepId::QueryLoginStatus)
            .fail(&FlowError::Policy("userLevel readonly".into()));
        run.add_scenario(scenario.clone());
        assert!(run.failures_all_policy());

        scenario
            .step_mut(StepId::InitiateLogin)
            .fail(&FlowError::Protocol("status 500".into()));
        run.scenarios[0] = scenario;
        assert!(!run.failures_all_policy());
    }

    #[test]
    fn test_skip_remaining_leaves_terminal_verdicts() {
        let mut scenario = ScenarioState::new("fresh");
        scenario.step_mut(StepId::InitiateLogin).pass(None);
        scenario.skip_remaining("stopped");
        assert_eq!(scenario.steps[0].verdict, StepVerdict::Pass);
        assert!(matches!(
            scenario.steps[1].verdict,
            StepVerdict::Skip { .. }
        ));
    }
}
