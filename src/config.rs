//! Run configuration resolved from CLI flags and environment variables.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::http::SessionConfig;

/// Fully-resolved configuration for one invocation.
///
/// Validation happens here, before any network call: clap reports missing
/// required arguments with exit code 2, which would collide with the exit
/// code reserved for policy failures, so password/domain are optional at the
/// CLI layer and checked in `resolve`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub username: String,
    pub password: String,
    /// Base domain; the IdP lives at auth.<domain>, the app at signalk.<domain>
    pub domain: String,
    pub client_id: String,
    /// Permission level the app must grant after login
    pub expect_level: String,
    pub output_dir: PathBuf,
    pub insecure: bool,
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Wall-clock budget for one flow run
    pub budget: Duration,
    pub verbose: bool,
}

impl RunConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        username: String,
        password: Option<String>,
        domain: Option<String>,
        client_id: String,
        expect_level: String,
        output: Option<PathBuf>,
        insecure: bool,
        timeout_secs: u64,
        max_redirects: usize,
        budget_secs: u64,
        verbose: bool,
    ) -> Result<Self> {
        let password = match password {
            Some(p) if !p.is_empty() => p,
            _ => bail!("Password is required (--password or AUTHELIA_PASSWORD)"),
        };
        let domain = match domain {
            Some(d) if !d.is_empty() => d.trim_matches('.').to_lowercase(),
            _ => bail!("Domain is required (--domain or HALOS_DOMAIN)"),
        };
        if !(1..=300).contains(&timeout_secs) {
            bail!("Timeout must be between 1 and 300 seconds");
        }
        if max_redirects == 0 {
            bail!("Redirect bound must be at least 1");
        }

        let output_dir = output.unwrap_or_else(|| {
            std::env::temp_dir().join(format!(
                "halos-oidc-{}",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            ))
        });

        Ok(Self {
            username,
            password,
            domain,
            client_id,
            expect_level,
            output_dir,
            insecure,
            timeout: Duration::from_secs(timeout_secs),
            max_redirects,
            budget: Duration::from_secs(budget_secs),
            verbose,
        })
    }

    /// Identity provider base URL.
    pub fn idp_url(&self) -> String {
        format!("https://auth.{}", self.domain)
    }

    /// Protected application base URL.
    pub fn app_url(&self) -> String {
        format!("https://signalk.{}", self.domain)
    }

    /// IdP host, for jar filtering in the SSO scenario.
    pub fn idp_host(&self) -> String {
        format!("auth.{}", self.domain)
    }

    /// Transport configuration for one run; each run gets its own trace
    /// subdirectory so concurrent scenarios never collide.
    pub fn session_config(&self, run_label: &str) -> SessionConfig {
        SessionConfig {
            insecure: self.insecure,
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            verbose: self.verbose,
            trace_dir: Some(self.output_dir.join(run_label)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(password: Option<&str>, domain: Option<&str>) -> Result<RunConfig> {
        RunConfig::resolve(
            "admin".into(),
            password.map(String::from),
            domain.map(String::from),
            "signalk".into(),
            "admin".into(),
            Some(PathBuf::from("/tmp/out")),
            true,
            15,
            10,
            120,
            false,
        )
    }

    #[test]
    fn test_missing_password_fails_before_any_network_call() {
        let err = resolve(None, Some("boat.local")).unwrap_err();
        assert!(err.to_string().contains("Password"));
    }

    #[test]
    fn test_empty_password_fails() {
        assert!(resolve(Some(""), Some("boat.local")).is_err());
    }

    #[test]
    fn test_missing_domain_fails() {
        let err = resolve(Some("secret123"), None).unwrap_err();
        assert!(err.to_string().contains("Domain"));
    }

    #[test]
    fn test_urls_derive_from_domain() {
        let config = resolve(Some("secret123"), Some("boat.local")).unwrap();
        assert_eq!(config.idp_url(), "https://auth.boat.local");
        assert_eq!(config.app_url(), "https://signalk.boat.local");
        assert_eq!(config.idp_host(), "auth.boat.local");
    }

    #[test]
    fn test_domain_is_normalized() {
        let config = resolve(Some("secret123"), Some("Boat.Local.")).unwrap();
        assert_eq!(config.domain, "boat.local");
    }
}
