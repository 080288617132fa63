use super::types::TestResults;
use anyhow::Result;
use std::path::Path;

/// Write the JSON report.
pub fn generate(results: &TestResults, output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(output, json)?;
    log::info!("JSON report saved to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::state::{RunState, ScenarioState, StepId};

    #[test]
    fn test_report_round_trips_through_json() {
        let mut run = RunState::new("run-1");
        let mut scenario = ScenarioState::new("fresh");
        scenario.step_mut(StepId::InitiateLogin).pass(Some("302".into()));
        scenario.skip_remaining("stopped");
        run.add_scenario(scenario);

        let results = TestResults {
            run_id: run.run_id.clone(),
            scenarios: run.scenarios.iter().map(|s| s.to_report()).collect(),
            summary: run.summary(),
            generated_at: "2026-01-01T00:00:00Z".into(),
        };

        let serialized = serde_json::to_string(&results).unwrap();
        let parsed: TestResults = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.scenarios.len(), 1);
        assert_eq!(parsed.scenarios[0].steps.len(), 7);
        assert_eq!(parsed.summary.passed, 1);
    }
}
