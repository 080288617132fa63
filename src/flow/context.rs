//! Facts discovered while driving a flow.
//!
//! The context is built incrementally: each executor reads what it needs and
//! appends what it discovers. Guarded fields are write-once (a second write
//! is an internal bug, not a protocol failure) except through the explicit
//! refresh that a new login flow performs.

use anyhow::{bail, Result};

/// Parsed `/skServer/loginStatus` fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginStatus {
    pub logged_in: bool,
    pub username: String,
    pub user_level: String,
}

#[derive(Debug, Clone)]
pub struct FlowContext {
    pub base_domain: String,
    pub idp_url: String,
    pub app_url: String,
    flow_id: Option<String>,
    last_location: Option<String>,
    code: Option<String>,
    state: Option<String>,
    login_status: Option<LoginStatus>,
    claims: Option<serde_json::Value>,
}

impl FlowContext {
    pub fn new(base_domain: &str, idp_url: &str, app_url: &str) -> Self {
        Self {
            base_domain: base_domain.to_string(),
            idp_url: idp_url.to_string(),
            app_url: app_url.to_string(),
            flow_id: None,
            last_location: None,
            code: None,
            state: None,
            login_status: None,
            claims: None,
        }
    }

    /// A fresh `InitiateLogin` is the one operation allowed to refresh the
    /// per-attempt fields.
    pub fn refresh_login(&mut self) {
        self.flow_id = None;
        self.last_location = None;
        self.code = None;
        self.state = None;
    }

    pub fn flow_id(&self) -> Option<&str> {
        self.flow_id.as_deref()
    }

    pub fn set_flow_id(&mut self, flow_id: String) -> Result<()> {
        if self.flow_id.is_some() {
            bail!("flow_id already set");
        }
        self.flow_id = Some(flow_id);
        Ok(())
    }

    /// Last redirect target seen; refreshed by every step that observes one.
    pub fn last_location(&self) -> Option<&str> {
        self.last_location.as_deref()
    }

    pub fn set_last_location(&mut self, location: String) {
        self.last_location = Some(location);
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn set_code_and_state(&mut self, code: String, state: String) -> Result<()> {
        if self.code.is_some() {
            bail!("authorization code already set");
        }
        self.code = Some(code);
        self.state = Some(state);
        Ok(())
    }

    pub fn login_status(&self) -> Option<&LoginStatus> {
        self.login_status.as_ref()
    }

    pub fn set_login_status(&mut self, status: LoginStatus) -> Result<()> {
        if self.login_status.is_some() {
            bail!("login status already set");
        }
        self.login_status = Some(status);
        Ok(())
    }

    pub fn claims(&self) -> Option<&serde_json::Value> {
        self.claims.as_ref()
    }

    pub fn set_claims(&mut self, claims: serde_json::Value) -> Result<()> {
        if self.claims.is_some() {
            bail!("token claims already set");
        }
        self.claims = Some(claims);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FlowContext {
        FlowContext::new(
            "boat.local",
            "https://auth.boat.local",
            "https://signalk.boat.local",
        )
    }

    #[test]
    fn test_code_is_write_once() {
        let mut ctx = ctx();
        ctx.set_code_and_state("abc".into(), "xyz".into()).unwrap();
        assert!(ctx.set_code_and_state("def".into(), "uvw".into()).is_err());
        assert_eq!(ctx.code(), Some("abc"));
    }

    #[test]
    fn test_refresh_login_clears_per_attempt_fields() {
        let mut ctx = ctx();
        ctx.set_flow_id("f1".into()).unwrap();
        ctx.set_code_and_state("abc".into(), "xyz".into()).unwrap();
        ctx.set_last_location("https://auth.boat.local/consent".into());

        ctx.refresh_login();
        assert!(ctx.flow_id().is_none());
        assert!(ctx.code().is_none());
        assert!(ctx.last_location().is_none());

        // Settable again after an explicit refresh
        ctx.set_flow_id("f2".into()).unwrap();
        assert_eq!(ctx.flow_id(), Some("f2"));
    }

    #[test]
    fn test_login_status_is_write_once() {
        let mut ctx = ctx();
        ctx.set_login_status(LoginStatus {
            logged_in: true,
            username: "admin".into(),
            user_level: "admin".into(),
        })
        .unwrap();
        assert!(ctx
            .set_login_status(LoginStatus::default())
            .is_err());
    }
}
