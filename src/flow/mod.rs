//! Flow orchestrator.
//!
//! Sequences the protocol step executors according to the flow state
//! machine, interprets branching outcomes, and records every step into the
//! run state. The orchestrator never catches generic errors: executors hand
//! it typed outcomes, and an `Err` from one of them is an internal bug that
//! surfaces at the application boundary.

pub mod context;
pub mod state;
pub mod steps;
pub mod token;

use anyhow::Result;
use colored::Colorize;
use std::future::Future;
use tokio::time::Instant;

use crate::config::RunConfig;
use crate::error::FlowError;
use crate::http::Session;
use context::FlowContext;
use state::{FlowPhase, RunState, ScenarioState, StepId, StepOutcome, StepPayload, StepVerdict};

/// Scenario selection, straight from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Fresh-login flow: no pre-existing IdP session, traverses Authenticate
    Fresh,
    /// SSO-reuse flow: seeds an IdP session, then proves cross-subdomain reuse
    Sso,
    /// Both, as isolated runs with one combined report
    All,
}

/// Named policy for the ambiguous SSO signal. "HTTP 200 with no login form"
/// is a heuristic, not a protocol guarantee, so only an observed
/// authorization code counts as a proven short-circuit; the heuristic alone
/// downgrades to a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsoShortCircuitPolicy {
    CodeRequired,
}

pub const SSO_SHORT_CIRCUIT_POLICY: SsoShortCircuitPolicy = SsoShortCircuitPolicy::CodeRequired;

/// Whether a drive expects the fresh-login path or the SSO short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowMode {
    Fresh,
    SsoReuse,
}

/// Drive the selected scenario(s). Each run owns its session and context;
/// nothing is shared across runs except the final report.
pub async fn run_scenarios(config: &RunConfig, scenario: Scenario) -> Result<RunState> {
    let mut run = RunState::new(&uuid::Uuid::new_v4().to_string());
    run.start();

    match scenario {
        Scenario::Fresh => run_fresh(config, &mut run).await?,
        Scenario::Sso => run_sso(config, &mut run).await?,
        Scenario::All => {
            run_fresh(config, &mut run).await?;
            run_sso(config, &mut run).await?;
        }
    }

    run.finish();
    Ok(run)
}

/// Best-effort GET of the IdP home page so baseline cookies exist before
/// the flow starts. Not a protocol step; a failure here surfaces on the
/// first real step instead.
async fn warm_up_idp(session: &mut Session, config: &RunConfig) {
    session.begin_step("idp-warmup");
    match session.get(&format!("{}/", config.idp_url())).await {
        Ok(resp) => log::debug!("IdP warm-up returned {}", resp.status),
        Err(e) => log::warn!("IdP warm-up failed: {}", e),
    }
}

/// Fresh-login flow on a brand-new session.
async fn run_fresh(config: &RunConfig, run: &mut RunState) -> Result<()> {
    println!("\n{} Scenario: {}", "▶".green().bold(), "fresh login".cyan());

    let mut session = Session::new(config.session_config("fresh"))?;
    warm_up_idp(&mut session, config).await;
    let mut ctx = FlowContext::new(&config.domain, &config.idp_url(), &config.app_url());
    let mut scenario = ScenarioState::new("fresh");
    let deadline = Instant::now() + config.budget;

    drive_flow(
        &mut session,
        &mut ctx,
        &mut scenario,
        FlowMode::Fresh,
        config,
        deadline,
    )
    .await?;

    scenario.finish();
    run.add_scenario(scenario);
    Ok(())
}

/// SSO-reuse flow: seed an IdP session with a full login, keep only the
/// IdP-side cookies, then re-initiate and expect the short-circuit.
async fn run_sso(config: &RunConfig, run: &mut RunState) -> Result<()> {
    println!(
        "\n{} Scenario: {} (seeding identity-provider session)",
        "▶".green().bold(),
        "sso reuse".cyan()
    );

    let mut session = Session::new(config.session_config("sso"))?;
    warm_up_idp(&mut session, config).await;
    let deadline = Instant::now() + config.budget;

    let mut seed = ScenarioState::new("sso-seed");
    {
        let mut ctx = FlowContext::new(&config.domain, &config.idp_url(), &config.app_url());
        drive_flow(
            &mut session,
            &mut ctx,
            &mut seed,
            FlowMode::Fresh,
            config,
            deadline,
        )
        .await?;
    }
    seed.finish();
    let seed_failed = seed.has_failure();
    run.add_scenario(seed);

    let mut reuse = ScenarioState::new("sso-reuse");
    if seed_failed {
        reuse.skip_remaining("seed login failed; no identity-provider session to reuse");
        reuse.finish();
        run.add_scenario(reuse);
        return Ok(());
    }

    // Judge which session cookies would actually cross subdomains before
    // dropping the app-side state.
    let shared: Vec<String> = session
        .jar
        .shared_across_subdomains(&config.domain)
        .iter()
        .map(|c| c.name.clone())
        .collect();
    if shared.is_empty() {
        reuse.notes.push(format!(
            "no cookie carries a .{} domain attribute; the IdP session will not cross subdomains",
            config.domain
        ));
    } else {
        reuse.notes.push(format!(
            "shared across subdomains of {}: {}",
            config.domain,
            shared.join(", ")
        ));
    }

    session.jar.retain_matching_host(&config.idp_host());
    log::debug!(
        "jar reduced to {} IdP cookie(s) for the reuse pass",
        session.jar.len()
    );

    println!(
        "{} Re-initiating login with only the IdP session cookie",
        "▶".green().bold()
    );
    let mut ctx = FlowContext::new(&config.domain, &config.idp_url(), &config.app_url());
    drive_flow(
        &mut session,
        &mut ctx,
        &mut reuse,
        FlowMode::SsoReuse,
        config,
        deadline,
    )
    .await?;

    reuse.finish();
    run.add_scenario(reuse);
    Ok(())
}

/// One pass of the flow state machine:
/// Init → LoginInitiated → {CodeObtained | ConsentPending | fail} →
/// (Authenticated → CodeObtained) → CallbackCompleted → StatusVerified → Done.
async fn drive_flow(
    session: &mut Session,
    ctx: &mut FlowContext,
    scenario: &mut ScenarioState,
    mode: FlowMode,
    config: &RunConfig,
    deadline: Instant,
) -> Result<()> {
    scenario.start();

    // Init → LoginInitiated
    let outcome = run_step(scenario, StepId::InitiateLogin, deadline, {
        steps::initiate_login(session, ctx)
    })
    .await?;
    match outcome {
        StepOutcome::Redirect { status, ref location } => {
            pass(scenario, StepId::InitiateLogin, format!("{} → {}", status, location));
            scenario.phase = FlowPhase::LoginInitiated;
        }
        other => {
            fail(scenario, StepId::InitiateLogin, &unexpected(other));
            return Ok(());
        }
    }

    // LoginInitiated → {CodeObtained | ConsentPending | terminal}
    let outcome = run_step(scenario, StepId::FollowToAuthChallenge, deadline, {
        steps::follow_to_auth_challenge(session, ctx)
    })
    .await?;
    match outcome {
        StepOutcome::Success(StepPayload::Code { .. }) => {
            scenario.branch = Some("ssoShortCircuit".into());
            pass(
                scenario,
                StepId::FollowToAuthChallenge,
                "authorization code issued without a challenge".into(),
            );
            let reason = match mode {
                FlowMode::Fresh => "IdP issued a code without a challenge",
                FlowMode::SsoReuse => "identity-provider session reused",
            };
            skip(scenario, StepId::Authenticate, reason);
            skip(scenario, StepId::ResolveConsent, reason);
            scenario.phase = FlowPhase::CodeObtained;
        }
        StepOutcome::Success(_) => {
            // The CodeRequired policy: 200 + no login form is not proof
            scenario.branch = Some("ambiguous200".into());
            match mode {
                FlowMode::SsoReuse => {
                    warn(
                        scenario,
                        StepId::FollowToAuthChallenge,
                        "no login form rendered, but no authorization code was observed".into(),
                    );
                    scenario.skip_remaining("no authorization code to continue with");
                }
                FlowMode::Fresh => {
                    fail(
                        scenario,
                        StepId::FollowToAuthChallenge,
                        &FlowError::Protocol(
                            "challenge chain ended in 200 with neither code nor flow id".into(),
                        ),
                    );
                }
            }
            return Ok(());
        }
        StepOutcome::ConsentRequired { ref flow_id } => match mode {
            FlowMode::Fresh => {
                scenario.branch = Some("consentRequired".into());
                pass(
                    scenario,
                    StepId::FollowToAuthChallenge,
                    format!("consent required, flow id {}", flow_id),
                );
                scenario.phase = FlowPhase::ConsentPending;
            }
            FlowMode::SsoReuse => {
                scenario.branch = Some("challengeReissued".into());
                fail(
                    scenario,
                    StepId::FollowToAuthChallenge,
                    &FlowError::Protocol(
                        "fresh authentication challenge issued; the IdP session was not reused"
                            .into(),
                    ),
                );
                return Ok(());
            }
        },
        StepOutcome::ReauthRequired => {
            scenario.branch = Some("reauthRequired".into());
            let error = match mode {
                FlowMode::Fresh => FlowError::Consent(
                    "login form rendered without a resolvable flow id".into(),
                ),
                FlowMode::SsoReuse => FlowError::Protocol(
                    "login form rendered; the IdP session was not reused".into(),
                ),
            };
            fail(scenario, StepId::FollowToAuthChallenge, &error);
            return Ok(());
        }
        other => {
            fail(scenario, StepId::FollowToAuthChallenge, &unexpected(other));
            return Ok(());
        }
    }

    // ConsentPending → Authenticated → CodeObtained
    if scenario.phase == FlowPhase::ConsentPending {
        let outcome = run_step(scenario, StepId::Authenticate, deadline, {
            steps::authenticate(session, ctx, &config.username, &config.password)
        })
        .await?;
        let consent_redirect = match outcome {
            StepOutcome::Success(StepPayload::Redirect(r)) => {
                pass(scenario, StepId::Authenticate, "first factor accepted".into());
                scenario.phase = FlowPhase::Authenticated;
                Some(r)
            }
            StepOutcome::Success(_) => {
                pass(
                    scenario,
                    StepId::Authenticate,
                    "first factor accepted (no redirect supplied)".into(),
                );
                scenario.phase = FlowPhase::Authenticated;
                None
            }
            other => {
                fail(scenario, StepId::Authenticate, &unexpected(other));
                return Ok(());
            }
        };

        let outcome = run_step(scenario, StepId::ResolveConsent, deadline, {
            steps::resolve_consent(session, ctx, consent_redirect.as_deref(), &config.client_id)
        })
        .await?;
        match outcome {
            StepOutcome::Success(StepPayload::Code { .. }) => {
                pass(scenario, StepId::ResolveConsent, "authorization code obtained".into());
                scenario.phase = FlowPhase::CodeObtained;
            }
            other => {
                fail(scenario, StepId::ResolveConsent, &unexpected(other));
                return Ok(());
            }
        }
    }

    // CodeObtained → CallbackCompleted
    let outcome = run_step(scenario, StepId::CompleteCallback, deadline, {
        steps::complete_callback(session, ctx)
    })
    .await?;
    match outcome {
        StepOutcome::Success(_) => {
            pass(scenario, StepId::CompleteCallback, "callback accepted".into());
            scenario.phase = FlowPhase::CallbackCompleted;
        }
        other => {
            fail(scenario, StepId::CompleteCallback, &unexpected(other));
            return Ok(());
        }
    }

    // CallbackCompleted → StatusVerified
    let outcome = run_step(scenario, StepId::QueryLoginStatus, deadline, {
        steps::query_login_status(session, ctx)
    })
    .await?;
    let logged_in = match outcome {
        StepOutcome::Success(StepPayload::LoginStatus(ref status)) => {
            if !status.logged_in {
                fail(
                    scenario,
                    StepId::QueryLoginStatus,
                    &FlowError::Protocol("loginStatus does not report loggedIn".into()),
                );
                false
            } else if status.user_level != config.expect_level {
                // Policy failure, kept distinct from infrastructure failures
                fail(
                    scenario,
                    StepId::QueryLoginStatus,
                    &FlowError::Policy(format!(
                        "authenticated as {:?} but userLevel {:?} does not meet expected {:?}",
                        status.username, status.user_level, config.expect_level
                    )),
                );
                false
            } else {
                pass(
                    scenario,
                    StepId::QueryLoginStatus,
                    format!("loggedIn as {} (userLevel={})", status.username, status.user_level),
                );
                scenario.phase = FlowPhase::StatusVerified;
                true
            }
        }
        other => {
            fail(scenario, StepId::QueryLoginStatus, &unexpected(other));
            false
        }
    };

    if !logged_in {
        scenario.skip_remaining("flow stopped before a session was verified");
        return Ok(());
    }

    // StatusVerified → Done; best-effort, never gates the verdict
    let outcome = run_step(scenario, StepId::DecodeToken, deadline, {
        steps::decode_token(session, ctx)
    })
    .await?;
    match outcome {
        StepOutcome::Success(StepPayload::Claims(ref claims)) => {
            // Full claims land next to the wire traces for postmortems
            if let Ok(json) = serde_json::to_string_pretty(claims) {
                let path = config
                    .output_dir
                    .join(format!("{}-claims.json", scenario.name));
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
            pass(scenario, StepId::DecodeToken, summarize_claims(claims));
        }
        StepOutcome::Failure(e) => skip(scenario, StepId::DecodeToken, &e.to_string()),
        other => skip(scenario, StepId::DecodeToken, &unexpected(other).to_string()),
    }

    if scenario.phase == FlowPhase::StatusVerified {
        scenario.phase = FlowPhase::Done;
    }
    Ok(())
}

/// Execute one step future under the run's wall-clock deadline. Exceeding
/// the budget aborts the step in progress and records it as a transport
/// failure instead of hanging.
async fn run_step<F>(
    scenario: &mut ScenarioState,
    step: StepId,
    deadline: Instant,
    fut: F,
) -> Result<StepOutcome>
where
    F: Future<Output = Result<StepOutcome>>,
{
    scenario.step_mut(step).start();
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(outcome) => outcome,
        Err(_) => Ok(StepOutcome::Failure(FlowError::Transport(
            "run wall-clock budget exceeded".into(),
        ))),
    }
}

fn unexpected(outcome: StepOutcome) -> FlowError {
    match outcome {
        StepOutcome::Failure(e) => e,
        other => FlowError::Protocol(format!("unexpected step outcome: {:?}", other)),
    }
}

fn pass(scenario: &mut ScenarioState, step: StepId, message: String) {
    println!("  {} {} {}", "✓".green(), step.as_str(), message.dimmed());
    scenario.step_mut(step).pass(Some(message));
}

fn fail(scenario: &mut ScenarioState, step: StepId, error: &FlowError) {
    println!("  {} {} {}", "✗".red().bold(), step.as_str(), error.to_string().red());
    scenario.step_mut(step).fail(error);
    scenario.skip_remaining("earlier step failed");
}

fn warn(scenario: &mut ScenarioState, step: StepId, reason: String) {
    println!("  {} {} {}", "⚠".yellow(), step.as_str(), reason.yellow());
    scenario.step_mut(step).warn(reason);
}

fn skip(scenario: &mut ScenarioState, step: StepId, reason: &str) {
    if matches!(scenario.step_mut(step).verdict, StepVerdict::Pending) {
        println!("  {} {} {}", "−".dimmed(), step.as_str(), reason.dimmed());
        scenario.step_mut(step).skip(reason.to_string());
    }
}

fn summarize_claims(claims: &serde_json::Value) -> String {
    let field = |key: &str| claims.get(key).and_then(|v| v.as_str()).unwrap_or("?");
    format!(
        "claims: sub={} iss={}",
        field("sub"),
        field("iss")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_preserves_typed_failure() {
        let err = unexpected(StepOutcome::Failure(FlowError::Authentication(
            "status deny".into(),
        )));
        assert_eq!(err, FlowError::Authentication("status deny".into()));
    }

    #[test]
    fn test_unexpected_wraps_other_outcomes_as_protocol() {
        let err = unexpected(StepOutcome::ReauthRequired);
        assert!(matches!(err, FlowError::Protocol(_)));
    }

    #[test]
    fn test_sso_policy_is_code_required() {
        assert_eq!(SSO_SHORT_CIRCUIT_POLICY, SsoShortCircuitPolicy::CodeRequired);
    }
}
