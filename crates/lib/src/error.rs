//! Error taxonomy shared by the registry, lifecycle manager, router and stores.
//!
//! Module seams keep their own narrow error types (`RegistryError`, `NluError`,
//! `ContainerError`); they convert into [`Error`] where a caller needs one type.

use crate::nlu::NluError;
use crate::registry::RegistryError;
use crate::runtime::ContainerError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Duplicate registration or an allocation that collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    /// Non-2xx or malformed response from the bridge, NLU runtime or container API.
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Partial provisioning or deprovisioning left state that does not match reality.
    #[error("inconsistent state: {0}")]
    Inconsistency(String),
    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::Upstream(_) => "upstream_failure",
            Error::Persistence(_) => "persistence_failure",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Inconsistency(_) => "inconsistency",
            Error::InvalidRequest { .. } => "invalid_request",
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }
}

impl From<NluError> for Error {
    fn from(e: NluError) -> Self {
        match e {
            NluError::Timeout(d) => Error::Timeout(format!("nlu runtime after {}s", d.as_secs())),
            other => Error::Upstream(other.to_string()),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Conflict(key) => Error::Conflict(format!("connection {}", key)),
            RegistryError::NotFound(key) => Error::NotFound(format!("connection {}", key)),
            other => Error::Upstream(other.to_string()),
        }
    }
}

impl From<ContainerError> for Error {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::NotFound(id) => Error::NotFound(format!("container {}", id)),
            ContainerError::Timeout(d) => {
                Error::Timeout(format!("container command after {}s", d.as_secs()))
            }
            other => Error::Upstream(other.to_string()),
        }
    }
}
