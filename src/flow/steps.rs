//! Protocol step executors.
//!
//! Each executor is a function of (session, flow context) producing a typed
//! `StepOutcome`, possibly extending the context. Transport errors are fully
//! converted into outcomes here; an `Err` return means an internal invariant
//! was violated, never a protocol failure.

use anyhow::{bail, Result};
use regex::Regex;
use reqwest::Url;

use crate::error::FlowError;
use crate::flow::context::{FlowContext, LoginStatus};
use crate::flow::state::{StepOutcome, StepPayload};
use crate::flow::token;
use crate::http::Session;

/// Extra attempts for the one idempotent step that may be retried.
const STATUS_RETRIES: u32 = 2;
const STATUS_RETRY_DELAY_MS: u64 = 500;

/// GET the app's OIDC login endpoint without following redirects. The app
/// must answer with a redirect to the IdP and set its anti-CSRF state cookie.
pub async fn initiate_login(session: &mut Session, ctx: &mut FlowContext) -> Result<StepOutcome> {
    ctx.refresh_login();
    session.begin_step("initiate-login");

    let url = format!("{}/signalk/v1/auth/oidc/login", ctx.app_url);
    let resp = match session.get(&url).await {
        Ok(r) => r,
        Err(e) => return Ok(StepOutcome::Failure(e)),
    };

    if !resp.is_redirect() {
        return Ok(StepOutcome::Failure(FlowError::Protocol(format!(
            "expected redirect from {}, got status {}",
            url, resp.status
        ))));
    }
    let location = match resp.location {
        Some(l) => l,
        None => {
            return Ok(StepOutcome::Failure(FlowError::Protocol(format!(
                "status {} without a Location header",
                resp.status
            ))))
        }
    };

    if session.jar.find("state").is_none() && session.jar.find("oidc").is_none() {
        log::warn!("app did not set an anti-CSRF state cookie on initiate");
    }

    ctx.set_last_location(location.clone());
    Ok(StepOutcome::Redirect {
        location,
        status: resp.status,
    })
}

/// Follow the IdP redirect chain, one bounded hop at a time, until reaching
/// either an authorization response (`code=` present, meaning a pre-existing
/// session short-circuited the flow), a login/consent challenge carrying a
/// flow id, or a login form we cannot complete without credentials.
pub async fn follow_to_auth_challenge(
    session: &mut Session,
    ctx: &mut FlowContext,
) -> Result<StepOutcome> {
    session.begin_step("follow-to-auth-challenge");

    let start = match ctx.last_location() {
        Some(l) => l.to_string(),
        None => bail!("follow_to_auth_challenge requires a prior redirect location"),
    };

    let mut current = resolve_url(&ctx.idp_url, &start)?;
    for _hop in 0..session.max_redirects() {
        // Inspect the target URL before requesting it: an authorization
        // response pointing back at the app callback must not be consumed
        // here (completing the callback is a separate step).
        if let Some((code, state)) = extract_code_and_state(current.as_str()) {
            ctx.set_last_location(current.to_string());
            ctx.set_code_and_state(code.clone(), state.clone())?;
            return Ok(StepOutcome::Success(StepPayload::Code { code, state }));
        }
        if let Some(flow_id) = find_flow_id_in_url(current.as_str()) {
            ctx.set_last_location(current.to_string());
            ctx.set_flow_id(flow_id.clone())?;
            return Ok(StepOutcome::ConsentRequired { flow_id });
        }

        let resp = match session.get(current.as_str()).await {
            Ok(r) => r,
            Err(e) => return Ok(StepOutcome::Failure(e)),
        };

        if resp.is_redirect() {
            let location = match resp.location {
                Some(l) => l,
                None => {
                    return Ok(StepOutcome::Failure(FlowError::Protocol(format!(
                        "status {} without a Location header at {}",
                        resp.status, current
                    ))))
                }
            };
            current = resolve_url(current.as_str(), &location)?;
            continue;
        }

        if resp.status == 200 {
            ctx.set_last_location(current.to_string());
            if let Some(flow_id) = find_flow_id_in_body(&resp.body) {
                ctx.set_flow_id(flow_id.clone())?;
                return Ok(StepOutcome::ConsentRequired { flow_id });
            }
            if looks_like_login_form(&resp.body) {
                return Ok(StepOutcome::ReauthRequired);
            }
            // Terminal 200 with neither challenge nor code: the ambiguous
            // SSO signal; the orchestrator's short-circuit policy decides
            return Ok(StepOutcome::Success(StepPayload::None));
        }

        return Ok(StepOutcome::Failure(FlowError::Protocol(format!(
            "unexpected status {} at {}",
            resp.status, current
        ))));
    }

    Ok(StepOutcome::Failure(FlowError::Protocol(format!(
        "redirect budget of {} hops exhausted following auth challenge",
        session.max_redirects()
    ))))
}

/// POST credentials as first factor. Never retried: re-posting credentials
/// is a mutating operation that can spawn duplicate IdP sessions.
pub async fn authenticate(
    session: &mut Session,
    ctx: &mut FlowContext,
    username: &str,
    password: &str,
) -> Result<StepOutcome> {
    session.begin_step("authenticate");

    let flow_id = match ctx.flow_id() {
        Some(f) => f.to_string(),
        None => {
            return Ok(StepOutcome::Failure(FlowError::Consent(
                "no flow id available for first-factor authentication".into(),
            )))
        }
    };

    let url = format!("{}/api/firstfactor", ctx.idp_url);
    let body = serde_json::json!({
        "username": username,
        "password": password,
        "keepMeLoggedIn": true,
        "flow": "openid_connect",
        "flowID": flow_id,
    });

    let resp = match session.post_json(&url, &body).await {
        Ok(r) => r,
        Err(e) => return Ok(StepOutcome::Failure(e)),
    };

    if resp.status != 200 {
        return Ok(StepOutcome::Failure(FlowError::Authentication(format!(
            "firstfactor returned status {}: {}",
            resp.status,
            truncate(&resp.body, 200)
        ))));
    }

    // The IdP's JSON shape varies across versions; absent fields degrade to
    // typed None instead of raising
    let parsed: serde_json::Value = serde_json::from_str(&resp.body).unwrap_or_default();
    let status = parsed
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let redirect = parsed
        .pointer("/data/redirect")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if status != "OK" {
        return Ok(StepOutcome::Failure(FlowError::Authentication(format!(
            "firstfactor status {:?}: {}",
            status,
            truncate(&resp.body, 200)
        ))));
    }

    match redirect {
        Some(r) => {
            ctx.set_last_location(r.clone());
            Ok(StepOutcome::Success(StepPayload::Redirect(r)))
        }
        None => Ok(StepOutcome::Success(StepPayload::None)),
    }
}

/// GET the consent/authorization endpoint and read the authorization
/// response from its Location header.
pub async fn resolve_consent(
    session: &mut Session,
    ctx: &mut FlowContext,
    consent_redirect: Option<&str>,
    client_id: &str,
) -> Result<StepOutcome> {
    session.begin_step("resolve-consent");

    let url = match consent_redirect {
        Some(r) => resolve_url(&ctx.idp_url, r)?.to_string(),
        // Explicit authorize-with-flow-id fallback for IdP versions that
        // answer firstfactor without a redirect
        None => match ctx.flow_id() {
            Some(flow_id) => format!(
                "{}/api/oidc/authorization?client_id={}&flow_id={}",
                ctx.idp_url, client_id, flow_id
            ),
            None => {
                return Ok(StepOutcome::Failure(FlowError::Consent(
                    "no consent redirect and no flow id to fall back to".into(),
                )))
            }
        },
    };

    let resp = match session.get(&url).await {
        Ok(r) => r,
        Err(e) => return Ok(StepOutcome::Failure(e)),
    };

    let location = match resp.location {
        Some(l) => l,
        None => {
            return Ok(StepOutcome::Failure(FlowError::Consent(format!(
                "expected authorization redirect, got status {}",
                resp.status
            ))))
        }
    };

    ctx.set_last_location(location.clone());
    match extract_code_and_state(&location) {
        Some((code, state)) => {
            ctx.set_code_and_state(code.clone(), state.clone())?;
            Ok(StepOutcome::Success(StepPayload::Code { code, state }))
        }
        None => {
            let reason = query_param(&location, "error_description")
                .or_else(|| query_param(&location, "error"))
                .unwrap_or_else(|| format!("no code in Location {}", truncate(&location, 120)));
            Ok(StepOutcome::Failure(FlowError::Consent(reason)))
        }
    }
}

/// GET the app's OIDC callback with code and state, following redirects,
/// and inspect the whole chain for the app's error marker.
pub async fn complete_callback(session: &mut Session, ctx: &mut FlowContext) -> Result<StepOutcome> {
    session.begin_step("complete-callback");

    let (code, state) = match (ctx.code(), ctx.state()) {
        (Some(c), Some(s)) => (c.to_string(), s.to_string()),
        _ => bail!("complete_callback requires an authorization code and state"),
    };

    let url = Url::parse_with_params(
        &format!("{}/signalk/v1/auth/oidc/callback", ctx.app_url),
        &[("code", code.as_str()), ("state", state.as_str())],
    )?;

    let resp = match session.get_following(url.as_str()).await {
        Ok(r) => r,
        Err(e) => return Ok(StepOutcome::Failure(e)),
    };

    for hop in &resp.chain {
        for candidate in [Some(hop.url.as_str()), hop.location.as_deref()]
            .into_iter()
            .flatten()
        {
            if candidate.contains("oidcError=true") {
                let message = query_param(candidate, "message")
                    .unwrap_or_else(|| "unspecified OIDC error".to_string());
                return Ok(StepOutcome::Failure(FlowError::Callback(message)));
            }
        }
    }

    ctx.set_last_location(resp.url.clone());
    Ok(StepOutcome::Success(StepPayload::None))
}

/// GET the app's login-status endpoint. Idempotent, so transient failures
/// are retried a bounded number of times.
pub async fn query_login_status(
    session: &mut Session,
    ctx: &mut FlowContext,
) -> Result<StepOutcome> {
    session.begin_step("query-login-status");

    let url = format!("{}/skServer/loginStatus", ctx.app_url);
    let mut last_error = FlowError::Transport("login status never attempted".into());

    for attempt in 0..=STATUS_RETRIES {
        if attempt > 0 {
            log::debug!("retrying login status, attempt {}", attempt + 1);
            tokio::time::sleep(std::time::Duration::from_millis(STATUS_RETRY_DELAY_MS)).await;
        }

        let resp = match session.get(&url).await {
            Ok(r) => r,
            Err(e) => {
                last_error = e;
                continue;
            }
        };
        if resp.status != 200 {
            last_error = FlowError::Protocol(format!("loginStatus returned status {}", resp.status));
            continue;
        }
        let parsed: serde_json::Value = match serde_json::from_str(&resp.body) {
            Ok(v) => v,
            Err(e) => {
                last_error = FlowError::Protocol(format!("loginStatus body is not JSON: {}", e));
                continue;
            }
        };

        let status = parse_login_status(&parsed);
        ctx.set_login_status(status.clone())?;
        return Ok(StepOutcome::Success(StepPayload::LoginStatus(status)));
    }

    Ok(StepOutcome::Failure(last_error))
}

/// Decode the payload of a JWT found in the cookie jar. Informational only;
/// the orchestrator downgrades a failure here to a skip.
pub async fn decode_token(session: &mut Session, ctx: &mut FlowContext) -> Result<StepOutcome> {
    session.begin_step("decode-token");

    let (name, value) = match token::find_jwt_cookie(&session.jar) {
        Some(found) => found,
        None => {
            return Ok(StepOutcome::Failure(FlowError::Protocol(
                "no JWT-shaped cookie in the jar".into(),
            )))
        }
    };

    match token::decode_payload(&value) {
        Some(claims) => {
            ctx.set_claims(claims.clone())?;
            log::debug!("decoded claims from cookie {}", name);
            Ok(StepOutcome::Success(StepPayload::Claims(claims)))
        }
        None => Ok(StepOutcome::Failure(FlowError::Protocol(format!(
            "cookie {} is JWT-shaped but its payload did not decode",
            name
        )))),
    }
}

// --- shared parsing helpers ---

fn resolve_url(base: &str, target: &str) -> Result<Url> {
    let base = Url::parse(base)?;
    Ok(base.join(target)?)
}

/// Percent-decoded value of one query parameter, from query or fragment.
pub(crate) fn query_param(url_str: &str, key: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let from_query = url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned().replace('+', " "));
    if from_query.is_some() {
        return from_query;
    }
    // Single-page IdPs put parameters behind the fragment
    let fragment = url.fragment()?;
    let query = fragment.splitn(2, '?').nth(1).unwrap_or(fragment);
    let fake = Url::parse(&format!("https://x/?{}", query)).ok()?;
    fake.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned().replace('+', " "))
}

pub(crate) fn extract_code_and_state(url_str: &str) -> Option<(String, String)> {
    let code = query_param(url_str, "code")?;
    let state = query_param(url_str, "state").unwrap_or_default();
    Some((code, state))
}

pub(crate) fn find_flow_id_in_url(url_str: &str) -> Option<String> {
    query_param(url_str, "flow_id").or_else(|| query_param(url_str, "flowID"))
}

pub(crate) fn find_flow_id_in_body(body: &str) -> Option<String> {
    let re = Regex::new(r#"(?i)flow[_-]?id["'=:\s]+([0-9a-fA-F][0-9a-fA-F-]{7,})"#).unwrap();
    re.captures(body)
        .map(|caps| caps[1].trim_end_matches('-').to_string())
}

pub(crate) fn looks_like_login_form(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("firstfactor")
        || lower.contains(r#"type="password""#)
        || lower.contains(r#"type='password'"#)
}

fn parse_login_status(parsed: &serde_json::Value) -> LoginStatus {
    let get = |key: &str| {
        parsed
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    LoginStatus {
        logged_in: get("status") == "loggedIn",
        username: get("username"),
        user_level: get("userLevel"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_and_state() {
        let (code, state) = extract_code_and_state(
            "https://signalk.boat.local/signalk/v1/auth/oidc/callback?code=authzcode&state=xyz",
        )
        .unwrap();
        assert_eq!(code, "authzcode");
        assert_eq!(state, "xyz");

        assert!(extract_code_and_state("https://auth.boat.local/?flow_id=abc").is_none());
    }

    #[test]
    fn test_find_flow_id_in_url_query_and_fragment() {
        assert_eq!(
            find_flow_id_in_url("https://auth.boat.local/?flow=openid_connect&flow_id=deadbeef-1"),
            Some("deadbeef-1".to_string())
        );
        assert_eq!(
            find_flow_id_in_url("https://auth.boat.local/#/consent?flow_id=deadbeef-2"),
            Some("deadbeef-2".to_string())
        );
        assert!(find_flow_id_in_url("https://auth.boat.local/").is_none());
    }

    #[test]
    fn test_find_flow_id_in_body() {
        let body = r#"{"status":"OK","data":{"flow_id":"0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9"}}"#;
        assert_eq!(
            find_flow_id_in_body(body),
            Some("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9".to_string())
        );
        assert!(find_flow_id_in_body("<html>nothing here</html>").is_none());
    }

    #[test]
    fn test_login_form_detection() {
        assert!(looks_like_login_form(
            r#"<form action="/api/firstfactor"><input type="password"></form>"#
        ));
        assert!(!looks_like_login_form("<html><body>Consent granted</body></html>"));
    }

    #[test]
    fn test_callback_error_message_is_percent_decoded() {
        let url = "https://signalk.boat.local/admin/?oidcError=true&message=Access%20denied%3A%20consent+rejected";
        assert_eq!(
            query_param(url, "message").unwrap(),
            "Access denied: consent rejected"
        );
    }

    #[test]
    fn test_parse_login_status_forgiving() {
        let full: serde_json::Value = serde_json::from_str(
            r#"{"status":"loggedIn","userLevel":"admin","username":"admin"}"#,
        )
        .unwrap();
        let status = parse_login_status(&full);
        assert!(status.logged_in);
        assert_eq!(status.user_level, "admin");

        // Shape variance degrades to empty fields, never a panic
        let sparse: serde_json::Value = serde_json::from_str(r#"{"status":"notLoggedIn"}"#).unwrap();
        let status = parse_login_status(&sparse);
        assert!(!status.logged_in);
        assert_eq!(status.username, "");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        let long = "é".repeat(300);
        let cut = truncate(&long, 199);
        assert!(cut.ends_with('…'));
    }
}
