//! Credential grammar: `{prefix}_{team}_{role}_{token}`.
//!
//! Only the SHA-256 of the token segment is ever stored.

use sha2::{Digest, Sha256};

use slipway_core::Role;
use slipway_state::CredentialRecord;

use crate::error::{AuthError, AuthResult};

/// Random bytes per token; rendered as hex.
const TOKEN_BYTES: usize = 24;

/// The segments of a presented credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCredential {
    pub team_id: String,
    pub role: Role,
    pub token: String,
}

impl ParsedCredential {
    /// Parse a raw credential. Team ids may contain `_`; the role and token
    /// are taken from the right.
    pub fn parse(prefix: &str, raw: &str) -> AuthResult<Self> {
        let rest = raw
            .trim()
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(|| AuthError::Malformed(format!("expected prefix {prefix:?}")))?;

        let mut parts = rest.rsplitn(3, '_');
        let token = parts.next().unwrap_or_default();
        let role = parts.next().unwrap_or_default();
        let team_id = parts.next().unwrap_or_default();

        if team_id.is_empty() {
            return Err(AuthError::Malformed("missing team segment".to_string()));
        }
        let role: Role = role
            .parse()
            .map_err(|_| AuthError::Malformed(format!("unknown role segment {role:?}")))?;
        if token.len() < 16 || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AuthError::Malformed("token segment is malformed".to_string()));
        }

        Ok(Self {
            team_id: team_id.to_string(),
            role,
            token: token.to_string(),
        })
    }

    pub fn token_hash(&self) -> String {
        hash_token(&self.token)
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Options for minting a new credential.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub team_id: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
}

/// Mint a credential. Returns the one-time secret and the record to store.
pub fn issue(prefix: &str, request: IssueRequest, now: u64) -> AuthResult<(String, CredentialRecord)> {
    if request.team_id.is_empty() {
        return Err(AuthError::Malformed("team id must not be empty".to_string()));
    }
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Entropy(e.to_string()))?;
    let token = hex::encode(bytes);

    let secret = format!("{prefix}_{}_{}_{token}", request.team_id, request.role);
    let scopes = if request.scopes.is_empty() {
        vec!["*".to_string()]
    } else {
        request.scopes
    };
    let record = CredentialRecord {
        id: uuid::Uuid::new_v4().to_string(),
        team_id: request.team_id,
        role: request.role,
        token_hash: hash_token(&token),
        scopes,
        expires_at: request.expires_at,
        created_at: now,
        last_used_at: None,
    };
    Ok((secret, record))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn parse_well_formed() {
        let parsed = ParsedCredential::parse("slw", &format!("slw_team42_admin_{TOKEN}")).unwrap();
        assert_eq!(parsed.team_id, "team42");
        assert_eq!(parsed.role, Role::Admin);
        assert_eq!(parsed.token, TOKEN);
    }

    #[test]
    fn team_may_contain_underscores() {
        let parsed =
            ParsedCredential::parse("slw", &format!("slw_acme_web_viewer_{TOKEN}")).unwrap();
        assert_eq!(parsed.team_id, "acme_web");
        assert_eq!(parsed.role, Role::Viewer);
    }

    #[test]
    fn rejects_malformed() {
        for raw in [
            format!("xyz_team_admin_{TOKEN}"),
            format!("slw_team_root_{TOKEN}"),
            format!("slw__admin_{TOKEN}"),
            "slw_team_admin_short".to_string(),
            format!("slw_admin_{TOKEN}"),
            format!("slwteam_admin_{TOKEN}"),
        ] {
            assert!(
                matches!(ParsedCredential::parse("slw", &raw), Err(AuthError::Malformed(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn issued_credential_parses_back() {
        let (secret, record) = issue(
            "slw",
            IssueRequest {
                team_id: "team1".to_string(),
                role: Role::Member,
                scopes: vec![],
                expires_at: Some(500),
            },
            100,
        )
        .unwrap();

        let parsed = ParsedCredential::parse("slw", &secret).unwrap();
        assert_eq!(parsed.token_hash(), record.token_hash);
        assert_eq!(record.scopes, vec!["*"]);
        assert!(!secret.contains(&record.token_hash));
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
