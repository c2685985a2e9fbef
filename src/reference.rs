//! Image references and OCI Distribution v2 path parsing.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::oci::{Digest, OciError};

// Repository name and tag grammars from the OCI distribution specification.
static MANIFESTS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^/v2/([a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*)/manifests/([^/]+)$",
    )
    .unwrap()
});
static BLOBS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^/v2/([a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*)/blobs/([^/]+)$",
    )
    .unwrap()
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

/// Canonical identifier of an image artifact: a registry, a repository and
/// exactly one of a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    kind: ReferenceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReferenceKind {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn with_tag(registry: &str, repository: &str, tag: &str) -> Result<Self, OciError> {
        if registry.is_empty() || repository.is_empty() || !TAG.is_match(tag) {
            return Err(OciError::InvalidReference(format!(
                "{registry}/{repository}:{tag}"
            )));
        }
        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            kind: ReferenceKind::Tag(tag.to_string()),
        })
    }

    pub fn with_digest(registry: &str, repository: &str, digest: Digest) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            kind: ReferenceKind::Digest(digest),
        }
    }

    /// Parse a full image name as stored by the container runtime, e.g.
    /// `docker.io/library/nginx:latest` or `docker.io/library/nginx@sha256:…`.
    pub fn parse(name: &str) -> Result<Self, OciError> {
        let (registry, rest) = name
            .split_once('/')
            .ok_or_else(|| OciError::InvalidReference(name.to_string()))?;
        if let Some((repository, digest)) = rest.split_once('@') {
            let digest = Digest::parse(digest)?;
            if registry.is_empty() || repository.is_empty() {
                return Err(OciError::InvalidReference(name.to_string()));
            }
            Ok(Self::with_digest(registry, repository, digest))
        } else if let Some((repository, tag)) = rest.rsplit_once(':') {
            Self::with_tag(registry, repository, tag)
        } else {
            Err(OciError::InvalidReference(name.to_string()))
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.kind {
            ReferenceKind::Tag(tag) => Some(tag),
            ReferenceKind::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.kind {
            ReferenceKind::Tag(_) => None,
            ReferenceKind::Digest(digest) => Some(digest),
        }
    }

    /// The key this artifact is advertised and resolved under: the digest
    /// string when one is known, the full reference string for a tag.
    pub fn key(&self) -> String {
        match &self.kind {
            ReferenceKind::Tag(_) => self.to_string(),
            ReferenceKind::Digest(digest) => digest.to_string(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReferenceKind::Tag(tag) => {
                write!(f, "{}/{}:{}", self.registry, self.repository, tag)
            }
            ReferenceKind::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

/// Classify a `/v2/{name}/manifests/{reference}` path. `Ok(None)` means the
/// path has a different shape; `Err` means it matched but is malformed.
pub fn manifest_reference(
    remote_registry: &str,
    path: &str,
) -> Result<Option<Reference>, OciError> {
    let Some(captures) = MANIFESTS_PATH.captures(path) else {
        return Ok(None);
    };
    let repository = &captures[1];
    let reference = &captures[2];
    if reference.contains(':') {
        let digest = Digest::parse(reference)?;
        Ok(Some(Reference::with_digest(
            remote_registry,
            repository,
            digest,
        )))
    } else {
        Reference::with_tag(remote_registry, repository, reference).map(Some)
    }
}

/// Classify a `/v2/{name}/blobs/{digest}` path. Blobs are only addressable
/// by digest; anything else in the digest position is an error.
pub fn blob_reference(remote_registry: &str, path: &str) -> Result<Option<Reference>, OciError> {
    let Some(captures) = BLOBS_PATH.captures(path) else {
        return Ok(None);
    };
    let digest = Digest::parse(&captures[2])?;
    Ok(Some(Reference::with_digest(
        remote_registry,
        &captures[1],
        digest,
    )))
}

/// Classify either endpoint shape.
pub fn any_reference(remote_registry: &str, path: &str) -> Result<Option<Reference>, OciError> {
    if let Some(reference) = manifest_reference(remote_registry, path)? {
        return Ok(Some(reference));
    }
    blob_reference(remote_registry, path)
}
