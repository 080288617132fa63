use super::types::TestResults;
use crate::flow::state::StepVerdict;
use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::path::Path;

/// Generate JUnit XML from the run results: one testsuite per scenario,
/// one testcase per protocol step, so CI dashboards show each step's
/// verdict separately.
pub fn generate_junit_xml(results: &TestResults) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let total_tests: usize = results.scenarios.iter().map(|s| s.steps.len()).sum();
    let total_failures = results.summary.failed as usize;
    let total_skipped = results.summary.skipped as usize;

    let mut suites_start = BytesStart::new("testsuites");
    suites_start.push_attribute(("name", "halos-oidc-tester-run"));
    suites_start.push_attribute(("tests", total_tests.to_string().as_str()));
    suites_start.push_attribute(("failures", total_failures.to_string().as_str()));
    suites_start.push_attribute(("skipped", total_skipped.to_string().as_str()));
    suites_start.push_attribute((
        "time",
        (results.summary.total_duration_ms.unwrap_or(0) as f64 / 1000.0)
            .to_string()
            .as_str(),
    ));
    writer.write_event(Event::Start(suites_start))?;

    for scenario in &results.scenarios {
        let failures = scenario
            .steps
            .iter()
            .filter(|s| matches!(s.verdict, StepVerdict::Fail { .. }))
            .count();
        let skipped = scenario
            .steps
            .iter()
            .filter(|s| matches!(s.verdict, StepVerdict::Skip { .. }))
            .count();

        let mut suite_start = BytesStart::new("testsuite");
        suite_start.push_attribute(("name", scenario.name.as_str()));
        suite_start.push_attribute(("tests", scenario.steps.len().to_string().as_str()));
        suite_start.push_attribute(("failures", failures.to_string().as_str()));
        suite_start.push_attribute(("skipped", skipped.to_string().as_str()));
        suite_start.push_attribute(("id", results.run_id.as_str()));
        suite_start.push_attribute((
            "time",
            (scenario.duration_ms.unwrap_or(0) as f64 / 1000.0)
                .to_string()
                .as_str(),
        ));
        suite_start.push_attribute(("timestamp", results.generated_at.as_str()));
        writer.write_event(Event::Start(suite_start))?;

        for step in &scenario.steps {
            let mut case_start = BytesStart::new("testcase");
            case_start.push_attribute(("name", step.name.as_str()));
            case_start.push_attribute(("classname", scenario.name.as_str()));
            case_start.push_attribute((
                "time",
                (step.duration_ms.unwrap_or(0) as f64 / 1000.0)
                    .to_string()
                    .as_str(),
            ));
            writer.write_event(Event::Start(case_start))?;

            match &step.verdict {
                StepVerdict::Fail { error, .. } => {
                    let mut fail_start = BytesStart::new("failure");
                    fail_start.push_attribute(("message", error.as_str()));
                    writer.write_event(Event::Start(fail_start))?;
                    writer.write_event(Event::Text(BytesText::new(error)))?;
                    writer.write_event(Event::End(BytesEnd::new("failure")))?;
                }
                StepVerdict::Skip { reason } | StepVerdict::Warn { reason } => {
                    // JUnit has no warn level; a warned step still passes,
                    // its reason lands in system-out
                    if matches!(step.verdict, StepVerdict::Skip { .. }) {
                        let mut skip_start = BytesStart::new("skipped");
                        skip_start.push_attribute(("message", reason.as_str()));
                        writer.write_event(Event::Empty(skip_start))?;
                    } else {
                        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
                        writer.write_event(Event::Text(BytesText::new(reason)))?;
                        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
                    }
                }
                _ => {}
            }

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let result = writer.into_inner().into_inner();
    let xml = String::from_utf8(result)?;
    Ok(xml)
}

/// Write the JUnit report to file.
pub fn write_report(results: &TestResults, output: &Path) -> Result<()> {
    let xml = generate_junit_xml(results)?;
    std::fs::write(output, xml)?;
    log::info!("JUnit report saved to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::flow::state::{RunState, ScenarioState, StepId};

    fn sample_results() -> TestResults {
        let mut run = RunState::new("run-1");
        let mut scenario = ScenarioState::new("fresh");
        scenario.step_mut(StepId::InitiateLogin).pass(None);
        scenario
            .step_mut(StepId::Authenticate)
            .fail(&FlowError::Authentication("status deny".into()));
        scenario.skip_remaining("earlier step failed");
        run.add_scenario(scenario);
        TestResults {
            run_id: run.run_id.clone(),
            scenarios: run.scenarios.iter().map(|s| s.to_report()).collect(),
            summary: run.summary(),
            generated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_junit_xml_structure() {
        let xml = generate_junit_xml(&sample_results()).unwrap();
        assert!(xml.contains(r#"<testsuite name="fresh""#));
        assert!(xml.contains(r#"<testcase name="initiate-login""#));
        assert!(xml.contains("authentication rejected: status deny"));
        assert!(xml.contains("<skipped"));
    }

    #[test]
    fn test_junit_counts_failures_per_suite() {
        let xml = generate_junit_xml(&sample_results()).unwrap();
        assert!(xml.contains(r#"tests="7""#));
        assert!(xml.contains(r#"failures="1""#));
    }
}
