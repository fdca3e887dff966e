//! Project names and version labels.
//!
//! Both end up verbatim in container names, file names and proxy
//! configuration, so they are restricted to characters with no meaning in
//! any of those.

use regex::Regex;
use thiserror::Error;

/// Longest accepted version label; matches the registry tag limit.
pub const MAX_VERSION_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("invalid project name {0:?}: use lowercase letters, digits and inner hyphens (at most 63)")]
    Project(String),
    #[error("invalid version label {0:?}: use letters, digits, '.', '_', '+' or '-' (at most 128)")]
    Version(String),
    #[error("name pattern: {0}")]
    Pattern(String),
}

/// A DNS label: it becomes the first label of the default host.
pub fn validate_project_name(name: &str) -> Result<(), NameError> {
    let re = Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
        .map_err(|e| NameError::Pattern(e.to_string()))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(NameError::Project(name.to_string()))
    }
}

pub fn validate_version_label(version: &str) -> Result<(), NameError> {
    let re = Regex::new(r"^[A-Za-z0-9._+-]+$").map_err(|e| NameError::Pattern(e.to_string()))?;
    if version.len() <= MAX_VERSION_LEN && re.is_match(version) {
        Ok(())
    } else {
        Err(NameError::Version(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names() {
        for ok in ["shop", "my-app", "a", "app2"] {
            assert_eq!(validate_project_name(ok), Ok(()), "{ok}");
        }
        for bad in ["", "Shop", "-shop", "shop-", "shop.staging", "shop app", "{env.HOME}"] {
            assert!(validate_project_name(bad).is_err(), "{bad}");
        }
        assert!(validate_project_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn version_labels() {
        for ok in ["v1", "1.2.3", "1.0.0+build.7", "release_2024-10", "0123456789ab"] {
            assert_eq!(validate_version_label(ok), Ok(()), "{ok}");
        }
        for bad in ["", "v1 x", "{env.AWS_SECRET_ACCESS_KEY}", "v1\n}", "a/b", "v1;rm"] {
            assert!(
                matches!(validate_version_label(bad), Err(NameError::Version(_))),
                "{bad}"
            );
        }
        assert!(validate_version_label(&"1".repeat(MAX_VERSION_LEN)).is_ok());
        assert!(validate_version_label(&"1".repeat(MAX_VERSION_LEN + 1)).is_err());
    }
}
