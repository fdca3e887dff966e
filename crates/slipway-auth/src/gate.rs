//! AuthGate — verifies credentials and checks permissions per operation.

use std::time::Duration;

use tracing::{debug, warn};

use slipway_core::{Role, epoch_secs};
use slipway_state::{Degradable, Persistence, Project};

use crate::credential::ParsedCredential;
use crate::error::{AuthError, AuthResult};
use crate::limiter::{RateDecision, RateLimiter};

/// The verified identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub team_id: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub credential_id: String,
}

impl AuthContext {
    /// The role half of [`AuthContext::authorize`]; needs no project lookup.
    pub fn require_role(&self, required: Role) -> AuthResult<()> {
        if self.role.permits(required) {
            Ok(())
        } else {
            Err(AuthError::InsufficientRole {
                required,
                actual: self.role,
            })
        }
    }

    /// Require `required` or higher, the project's team, and a matching scope.
    pub fn authorize(&self, required: Role, project: &Project) -> AuthResult<()> {
        self.require_role(required)?;
        if project.team_id != self.team_id {
            return Err(AuthError::TeamMismatch {
                project: project.name.clone(),
            });
        }
        if !self.scopes.iter().any(|s| s == "*" || *s == project.name) {
            return Err(AuthError::OutOfScope {
                project: project.name.clone(),
            });
        }
        Ok(())
    }
}

pub struct AuthGate {
    persistence: Persistence,
    prefix: String,
    limiter: RateLimiter,
}

impl AuthGate {
    pub fn new(persistence: Persistence, prefix: &str, max_requests: u32, window: Duration) -> Self {
        Self {
            persistence,
            prefix: prefix.to_string(),
            limiter: RateLimiter::new(max_requests, window),
        }
    }

    /// Verify a raw credential and build its [`AuthContext`].
    pub async fn authenticate(&self, raw: &str) -> AuthResult<Degradable<AuthContext>> {
        let parsed = ParsedCredential::parse(&self.prefix, raw)?;
        let hash = parsed.token_hash();

        let lookup = self.persistence.find_credential(&hash)?;
        let degraded = lookup.degraded;
        let record = lookup.value.ok_or(AuthError::UnknownCredential)?;

        // The visible segments must agree with what was issued.
        if record.team_id != parsed.team_id || record.role != parsed.role {
            debug!(credential = %record.id, "credential segments do not match stored record");
            return Err(AuthError::UnknownCredential);
        }

        let now = epoch_secs();
        if record.expires_at.is_some_and(|at| now >= at) {
            return Err(AuthError::CredentialExpired);
        }

        if let RateDecision::Limited { retry_after } =
            self.limiter.check_and_record(&record.id).await
        {
            warn!(credential = %record.id, retry_after_ms = retry_after.as_millis() as u64, "credential rate limited");
            return Err(AuthError::RateLimited { retry_after });
        }

        let persistence = self.persistence.clone();
        let credential_id = record.id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = persistence.touch_credential(&hash, now) {
                warn!(credential = %credential_id, error = %e, "failed to record credential use");
            }
        });

        let context = AuthContext {
            team_id: record.team_id,
            role: record.role,
            scopes: record.scopes,
            credential_id: record.id,
        };
        debug!(credential = %context.credential_id, team = %context.team_id, role = %context.role, "credential verified");
        Ok(Degradable {
            value: context,
            degraded,
        })
    }
}
