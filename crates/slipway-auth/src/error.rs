use std::time::Duration;

use slipway_core::Role;
use slipway_state::StateError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("unknown credential")]
    UnknownCredential,

    #[error("credential expired")]
    CredentialExpired,

    #[error("rate limit exceeded, retry in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("operation requires role {required}, credential has {actual}")]
    InsufficientRole { required: Role, actual: Role },

    #[error("project {project} belongs to another team")]
    TeamMismatch { project: String },

    #[error("credential is not scoped to project {project}")]
    OutOfScope { project: String },

    #[error("could not generate credential token: {0}")]
    Entropy(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl AuthError {
    /// Whether the caller could not be identified at all (as opposed to
    /// being identified but not allowed).
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::Malformed(_) | AuthError::UnknownCredential | AuthError::CredentialExpired
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            AuthError::InsufficientRole { .. }
                | AuthError::TeamMismatch { .. }
                | AuthError::OutOfScope { .. }
        )
    }
}
