//! Domain errors for the director.
//!
//! Every error an operator can see carries a stable numeric code and a
//! default HTTP status. Task workers write `{code, description}` into the
//! task result; the API layer returns the same body with the carried status.
//! Anything not representable here is a non-domain failure and surfaces as
//! a bare 500.

use thiserror::Error;

/// Result alias for operations that fail with a domain error.
pub type DirectorResult<T> = Result<T, DirectorError>;

/// The closed set of domain errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DirectorError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("bad manifest: {0}")]
    BadManifest(String),

    #[error("username in path does not match username in body")]
    UserImmutableUsername,

    #[error("not authorized")]
    NotAuthorized,

    #[error("lock is busy: {0}")]
    LockBusy(String),

    #[error("release in use: {0}")]
    ReleaseInUse(String),

    #[error("stemcell in use: {name}/{version}")]
    StemcellInUse { name: String, version: String },

    #[error("deployment in use: {0}")]
    DeploymentInUse(String),

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("agent {agent_id} timed out on {method}")]
    AgentTimeout { agent_id: String, method: String },

    #[error("agent {agent_id} error: {message}")]
    RemoteError { agent_id: String, message: String },

    #[error("cloud error: {0}")]
    CloudError(String),

    #[error("compilation of {package} failed: {detail}")]
    CompilationFailed { package: String, detail: String },

    #[error("update of {job}/{index} failed: {detail}")]
    InstanceUpdateFailed {
        job: String,
        index: u32,
        detail: String,
    },

    #[error("task cancelled")]
    Cancelled,
}

impl DirectorError {
    /// Stable numeric error code, grouped by kind.
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound { .. } => 10001,
            Self::ValidationFailed(_) => 10002,
            Self::BadManifest(_) => 10003,
            Self::UserImmutableUsername => 10004,
            Self::NotAuthorized => 10005,
            Self::LockBusy(_) => 20001,
            Self::ReleaseInUse(_) => 20002,
            Self::StemcellInUse { .. } => 20003,
            Self::DeploymentInUse(_) => 20004,
            Self::AgentUnreachable(_) => 30001,
            Self::AgentTimeout { .. } => 30002,
            Self::RemoteError { .. } => 30003,
            Self::CloudError(_) => 30004,
            Self::CompilationFailed { .. } => 40001,
            Self::InstanceUpdateFailed { .. } => 40002,
            Self::Cancelled => 40003,
        }
    }

    /// Default HTTP status for this error when surfaced synchronously.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::ValidationFailed(_) | Self::BadManifest(_) | Self::UserImmutableUsername => 400,
            Self::NotAuthorized => 401,
            Self::LockBusy(_)
            | Self::ReleaseInUse(_)
            | Self::StemcellInUse { .. }
            | Self::DeploymentInUse(_) => 409,
            _ => 500,
        }
    }

    /// Shorthand for the ubiquitous not-found constructors.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DirectorError::not_found("release", "redis").code(), 10001);
        assert_eq!(DirectorError::LockBusy("lock:release".into()).code(), 20001);
        assert_eq!(DirectorError::Cancelled.code(), 40003);
    }

    #[test]
    fn statuses_follow_kind() {
        assert_eq!(DirectorError::not_found("task", "42").http_status(), 404);
        assert_eq!(DirectorError::NotAuthorized.http_status(), 401);
        assert_eq!(
            DirectorError::DeploymentInUse("prod".into()).http_status(),
            409
        );
        assert_eq!(DirectorError::CloudError("boom".into()).http_status(), 500);
    }

    #[test]
    fn validation_joins_issues() {
        let err = DirectorError::ValidationFailed(vec![
            "ip 10.0.0.9 outside static range".into(),
            "pool small is exhausted".into(),
        ]);
        let text = err.to_string();
        assert!(text.contains("10.0.0.9"));
        assert!(text.contains("; "));
    }
}
