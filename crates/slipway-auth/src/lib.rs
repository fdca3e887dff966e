//! slipway-auth — the gate every orchestration call passes first.
//!
//! Credentials look like `{prefix}_{team}_{role}_{token}`. The token is
//! hashed with SHA-256 and looked up in the durable store; expiry, a
//! per-credential sliding-window rate limit, and the role hierarchy are
//! enforced before an [`AuthContext`] is handed to the engines.

pub mod credential;
pub mod error;
pub mod gate;
pub mod limiter;

pub use credential::{IssueRequest, ParsedCredential, hash_token, issue};
pub use error::{AuthError, AuthResult};
pub use gate::{AuthContext, AuthGate};
pub use limiter::{RateDecision, RateLimiter};
