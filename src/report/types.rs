use crate::flow::state::{RunSummary, ScenarioReport};
use serde::{Deserialize, Serialize};

/// Full results of one invocation, as written to `report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub run_id: String,
    pub scenarios: Vec<ScenarioReport>,
    pub summary: RunSummary,
    pub generated_at: String,
}
