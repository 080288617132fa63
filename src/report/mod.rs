pub mod json;
pub mod junit;
pub mod types;

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

use crate::flow::state::{RunState, RunVerdict};
use types::TestResults;

/// Exit code for a run whose only failures are policy failures
/// (authenticated, wrong permission level). Calling automation relies on
/// telling this apart from infrastructure failure.
pub const EXIT_POLICY_FAILURE: i32 = 2;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SUCCESS: i32 = 0;

/// Render the console summary, write the report files, and map the run to
/// its exit code.
pub fn finalize(run: &RunState, output_dir: &Path) -> Result<i32> {
    let results = TestResults {
        run_id: run.run_id.clone(),
        scenarios: run.scenarios.iter().map(|s| s.to_report()).collect(),
        summary: run.summary(),
        generated_at: chrono::Utc::now().to_rfc3339(),
    };

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;
    json::generate(&results, &output_dir.join("report.json"))?;
    junit::write_report(&results, &output_dir.join("report.xml"))?;

    print_summary(&results, output_dir);

    Ok(exit_code(run))
}

/// 0 = pass (warnings allowed), 1 = hard failure, 2 = policy failure only.
pub fn exit_code(run: &RunState) -> i32 {
    match run.overall() {
        RunVerdict::Fail => {
            if run.failures_all_policy() {
                EXIT_POLICY_FAILURE
            } else {
                EXIT_FAILURE
            }
        }
        RunVerdict::Warn | RunVerdict::Pass => EXIT_SUCCESS,
    }
}

fn print_summary(results: &TestResults, output_dir: &Path) {
    let summary = &results.summary;

    println!();
    for scenario in &results.scenarios {
        let branch = scenario
            .branch
            .as_deref()
            .map(|b| format!(" [{}]", b))
            .unwrap_or_default();
        println!(
            "  {} {}{} — phase {:?}, {}ms",
            "•".blue(),
            scenario.name.cyan(),
            branch.dimmed(),
            scenario.phase,
            scenario.duration_ms.unwrap_or(0)
        );
        for note in &scenario.notes {
            println!("    {}", note.dimmed());
        }
    }

    println!(
        "\n  Scenarios: {}  Steps: {}  {}: {}  {}: {}  {}: {}  {}: {}",
        summary.total_scenarios,
        summary.total_steps,
        "Passed".green(),
        summary.passed,
        "Failed".red(),
        summary.failed,
        "Warned".yellow(),
        summary.warned,
        "Skipped".dimmed(),
        summary.skipped,
    );

    let verdict = match summary.verdict {
        RunVerdict::Pass => "PASS".green().bold(),
        RunVerdict::Warn => "PASS (with warnings)".yellow().bold(),
        RunVerdict::Fail => "FAIL".red().bold(),
    };
    println!("  Verdict: {}", verdict);
    println!("  Report: {}", output_dir.join("report.json").display().to_string().cyan());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::flow::state::{ScenarioState, StepId};

    fn run_with(failures: &[FlowError]) -> RunState {
        let mut run = RunState::new("r1");
        let mut scenario = ScenarioState::new("fresh");
        scenario.step_mut(StepId::InitiateLogin).pass(None);
        for (i, err) in failures.iter().enumerate() {
            scenario.steps[i + 1].fail(err);
        }
        run.add_scenario(scenario);
        run
    }

    #[test]
    fn test_exit_zero_on_pass() {
        assert_eq!(exit_code(&run_with(&[])), EXIT_SUCCESS);
    }

    #[test]
    fn test_exit_one_on_infrastructure_failure() {
        let run = run_with(&[FlowError::Protocol("status 500".into())]);
        assert_eq!(exit_code(&run), EXIT_FAILURE);
    }

    #[test]
    fn test_exit_two_reserved_for_pure_policy_failure() {
        let run = run_with(&[FlowError::Policy("userLevel readonly".into())]);
        assert_eq!(exit_code(&run), EXIT_POLICY_FAILURE);
    }

    #[test]
    fn test_mixed_failures_force_exit_one() {
        let run = run_with(&[
            FlowError::Policy("userLevel readonly".into()),
            FlowError::Protocol("status 500".into()),
        ]);
        assert_eq!(exit_code(&run), EXIT_FAILURE);
    }

    #[test]
    fn test_warn_exits_zero() {
        let mut run = run_with(&[]);
        run.scenarios[0]
            .step_mut(StepId::FollowToAuthChallenge)
            .warn("ambiguous".into());
        assert_eq!(exit_code(&run), EXIT_SUCCESS);
    }
}
