use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure taxonomy for protocol steps.
///
/// Every transport-level problem is converted into one of these variants by
/// the step executors; the orchestrator only ever inspects typed outcomes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    /// Connection, TLS, or timeout failure below the protocol layer
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected status code or missing required header
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The identity provider rejected the credentials
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// No consent flow id could be resolved
    #[error("consent error: {0}")]
    Consent(String),

    /// The application reported an OIDC callback error
    #[error("callback error: {0}")]
    Callback(String),

    /// Login succeeded but the granted permission level is wrong
    #[error("policy violation: {0}")]
    Policy(String),
}

/// Failure class carried into reports, so callback automation can tell a
/// policy violation apart from a broken deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transport,
    Protocol,
    Authentication,
    Consent,
    Callback,
    Policy,
}

impl FlowError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FlowError::Transport(_) => FailureKind::Transport,
            FlowError::Protocol(_) => FailureKind::Protocol,
            FlowError::Authentication(_) => FailureKind::Authentication,
            FlowError::Consent(_) => FailureKind::Consent,
            FlowError::Callback(_) => FailureKind::Callback,
            FlowError::Policy(_) => FailureKind::Policy,
        }
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FlowError::Transport(format!("request timed out: {}", err))
        } else if err.is_connect() {
            FlowError::Transport(format!("connection failed: {}", err))
        } else {
            FlowError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_kind_is_distinct() {
        let policy = FlowError::Policy("userLevel readonly, expected admin".into());
        let protocol = FlowError::Protocol("status 500".into());
        assert_eq!(policy.kind(), FailureKind::Policy);
        assert_ne!(policy.kind(), protocol.kind());
    }

    #[test]
    fn test_display_names_step_reason() {
        let err = FlowError::Callback("access denied".into());
        assert_eq!(err.to_string(), "callback error: access denied");
    }
}
