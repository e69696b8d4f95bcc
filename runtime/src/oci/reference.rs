//! Digest-pinned image reference parsing.
//!
//! Parses references like `registry.example.com:5000/team/app@sha256:abc...`
//! into registry host, repository path and content digest. Host, repository
//! and digest are parsed as three independent productions, so a port in the
//! host or a tag in the repository never shifts the digest boundary.

use soci_builder_core::error::{BuilderError, Result};

/// Parsed, digest-pinned image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with port if present (e.g., "registry.example.com:5000")
    pub registry: String,
    /// Repository path without host or reference suffix (e.g., "team/app")
    pub repository: String,
    /// Digest with algorithm prefix (e.g., "sha256:abc123...")
    pub digest: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `host/repo@sha256:abc...`
    /// - `host:5000/org/repo@sha256:abc...`
    /// - `host/repo:sha256:abc...` (digest after the first colon of the path)
    /// - `host/repo:tag@sha256:abc...` (tag is ignored, digest wins)
    ///
    /// Tag-only references are rejected: the digest is what gets indexed.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(malformed(reference, "empty image reference"));
        }

        let (host, remainder) = reference
            .split_once('/')
            .ok_or_else(|| malformed(reference, "missing '/' between registry host and repository"))?;
        let registry = parse_host(reference, host)?;

        let (name, digest) = if let Some((name, digest)) = remainder.rsplit_once('@') {
            (strip_tag(name), digest)
        } else if let Some((name, digest)) = remainder.split_once(':') {
            (name, digest)
        } else {
            return Err(malformed(reference, "missing digest"));
        };

        let repository = parse_repository(reference, name)?;
        let digest = parse_digest(reference, digest)?;

        Ok(ImageReference {
            registry,
            repository,
            digest,
        })
    }

    /// Repository and digest, e.g. `team/app@sha256:abc`.
    pub fn name(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        format!("{}/{}@{}", self.registry, self.repository, self.digest)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn malformed(reference: &str, reason: impl Into<String>) -> BuilderError {
    BuilderError::MalformedReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// `name:tag` → `name`. Only looks after the last `/` so path separators are untouched.
fn strip_tag(name: &str) -> &str {
    let last_component_start = name.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name[last_component_start..].find(':') {
        Some(colon) => &name[..last_component_start + colon],
        None => name,
    }
}

/// host = hostname-label *("." hostname-label) [":" port]
fn parse_host(reference: &str, host: &str) -> Result<String> {
    if host.is_empty() {
        return Err(malformed(reference, "empty registry host"));
    }

    let (hostname, port) = match host.rsplit_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host, None),
    };

    let labels_valid = !hostname.is_empty()
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if !labels_valid {
        return Err(malformed(
            reference,
            format!("invalid registry host '{}'", host),
        ));
    }

    if let Some(port) = port {
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(malformed(
                reference,
                format!("invalid registry port '{}'", port),
            ));
        }
    }

    Ok(host.to_string())
}

/// repository = path-component *("/" path-component)
fn parse_repository(reference: &str, name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(malformed(reference, "empty repository"));
    }

    for component in name.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid {
            return Err(malformed(
                reference,
                format!("invalid repository path component '{}'", component),
            ));
        }
    }

    Ok(name.to_string())
}

/// digest = algorithm ":" encoded
fn parse_digest(reference: &str, digest: &str) -> Result<String> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        malformed(
            reference,
            format!(
                "'{}' is not a digest (expected algorithm:hex); tag references are not supported",
                digest
            ),
        )
    })?;

    let algorithm_valid = !algorithm.is_empty()
        && algorithm
            .split(|c| matches!(c, '+' | '.' | '_' | '-'))
            .all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            });
    if !algorithm_valid {
        return Err(malformed(
            reference,
            format!("invalid digest algorithm '{}'", algorithm),
        ));
    }

    let expected_len = match algorithm {
        "sha256" => Some(64),
        "sha512" => Some(128),
        _ => None,
    };
    let encoded_valid = match expected_len {
        Some(len) => {
            encoded.len() == len
                && encoded
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => {
            !encoded.is_empty()
                && encoded
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-'))
        }
    };
    if !encoded_valid {
        return Err(malformed(
            reference,
            format!("invalid {} digest '{}'", algorithm, encoded),
        ));
    }

    Ok(digest.to_string())
}
