//! Container image references.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed `[registry/]repository[:tag][@sha256:digest]` reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host (with optional port), e.g. `ghcr.io` or `localhost:5000`.
    pub registry: Option<String>,
    /// Repository path, e.g. `acme/storefront`.
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest including the algorithm prefix.
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid image reference {reference:?}: {reason}")]
    Invalid { reference: String, reason: String },
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::Empty);
        }
        let invalid = |reason: &str| ImageError::Invalid {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let hex = digest
                    .strip_prefix("sha256:")
                    .ok_or_else(|| invalid("digest must use sha256"))?;
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("digest must be 64 hex characters"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (registry, rest) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (Some(first.to_string()), rest),
            _ => (None, name),
        };

        // A tag lives after the last ':' of the final path component.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match rest[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        for component in repository.split('/') {
            if component.is_empty() || !component.chars().all(is_repository_char) {
                return Err(invalid("repository components must be lowercase [a-z0-9._-]"));
            }
        }
        if let Some(tag) = &tag {
            if tag.is_empty()
                || tag.len() > 128
                || !tag.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
            {
                return Err(invalid("malformed tag"));
            }
        }

        Ok(ImageRef {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The tag, defaulting to `latest` when neither tag nor digest is given.
    pub fn effective_tag(&self) -> Option<&str> {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => Some(tag.as_str()),
            (None, Some(_)) => None,
            (None, None) => Some("latest"),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn looks_like_registry(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

fn is_repository_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c)
}
