//! Rejection and fault taxonomy.
//!
//! A [`Rejection`] is a policy outcome and travels back to the client inside a
//! successful response. An [`ExecError`] is an infrastructure fault and
//! surfaces as a transport-level error.

use thiserror::Error;

/// Why the policy gate (or a precondition) refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unauthorized")]
    Unauthorized,
    #[error("banned")]
    Banned,
    #[error("command not allowed")]
    CommandNotAllowed,
    #[error("chaining/piping is blocked")]
    ChainingBlocked,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("client not registered")]
    NotRegistered,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Rejection {
    /// Stable machine-readable reason placed in response `rejection` fields.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Banned => "banned",
            Self::CommandNotAllowed => "command not allowed",
            Self::ChainingBlocked => "chaining/piping is blocked",
            Self::RateLimited => "rate limit exceeded",
            Self::NotRegistered => "not registered",
            Self::NotFound(_) => "not found",
            Self::InvalidArgument(_) => "invalid argument",
        }
    }
}

/// Failure to run a process at all.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("execution task failed: {0}")]
    Join(String),
}

/// Everything an [`ExecutionService`](crate::service::ExecutionService) call can end in.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl ServiceError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            Self::Exec(_) => None,
        }
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Rejected(Rejection::Unauthorized) => {
                tonic::Status::unauthenticated("unauthorized")
            }
            ServiceError::Rejected(r) => tonic::Status::failed_precondition(r.to_string()),
            ServiceError::Exec(e) => tonic::Status::internal(e.to_string()),
        }
    }
}
