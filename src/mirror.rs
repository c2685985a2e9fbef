//! Mirror configuration for the container runtime.
//!
//! The `configuration` subcommand writes one `hosts.toml` per mirrored
//! registry under the runtime's registry configuration directory, pointing
//! pulls at the mirror registries before the upstream. Written once by an
//! init container; the matching reader exists so the files round-trip.

use std::path::{Path, PathBuf};

use http::Uri;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

const HOSTS_FILE: &str = "hosts.toml";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("could not render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("registry url has no host: {0}")]
    MissingHost(String),

    #[error("invalid registry url {0:?}")]
    InvalidUrl(String),
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct HostsConfig {
    server: String,
    #[serde(default)]
    host: IndexMap<String, HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct HostConfig {
    capabilities: Vec<String>,
}

/// Write `hosts.toml` for every registry, declaring each mirror registry as
/// a pull+resolve host. Files are written to a temporary name and renamed
/// into place.
pub async fn add_mirror_configuration(
    dir: &Path,
    registries: &[Uri],
    mirror_registries: &[Uri],
) -> Result<(), MirrorError> {
    let host: IndexMap<String, HostConfig> = mirror_registries
        .iter()
        .map(|mirror| {
            (
                canonical(mirror),
                HostConfig {
                    capabilities: vec!["pull".to_string(), "resolve".to_string()],
                },
            )
        })
        .collect();
    for registry in registries {
        let authority = registry
            .authority()
            .ok_or_else(|| MirrorError::MissingHost(registry.to_string()))?;
        let registry_dir = dir.join(authority.as_str());
        fs::create_dir_all(&registry_dir).await?;
        let config = HostsConfig {
            server: canonical(registry),
            host: host.clone(),
        };
        let rendered = toml::to_string(&config)?;
        let staged = registry_dir.join(".hosts.toml.tmp");
        fs::write(&staged, rendered).await?;
        fs::rename(&staged, registry_dir.join(HOSTS_FILE)).await?;
        info!(registry = %registry, path = %registry_dir.display(), "wrote mirror configuration");
    }
    Ok(())
}

/// Read back what [`add_mirror_configuration`] wrote. Registries are
/// returned in directory-name order; mirror registries in file order,
/// deduplicated.
pub async fn read_mirror_configuration(dir: &Path) -> Result<(Vec<Uri>, Vec<Uri>), MirrorError> {
    let mut registry_dirs: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            registry_dirs.push(entry.path());
        }
    }
    registry_dirs.sort();

    let mut registries = Vec::new();
    let mut mirror_registries: Vec<Uri> = Vec::new();
    for registry_dir in registry_dirs {
        let path = registry_dir.join(HOSTS_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        let config: HostsConfig = toml::from_str(&raw)?;
        registries.push(parse_url(&config.server)?);
        for mirror in config.host.keys() {
            let mirror = parse_url(mirror)?;
            if !mirror_registries.contains(&mirror) {
                mirror_registries.push(mirror);
            }
        }
    }
    Ok((registries, mirror_registries))
}

/// Uri renders a bare authority with a trailing slash; strip it so the file
/// carries the URL the way it was given.
fn canonical(uri: &Uri) -> String {
    let rendered = uri.to_string();
    match rendered.strip_suffix('/') {
        Some(stripped) if uri.path() == "/" => stripped.to_string(),
        _ => rendered,
    }
}

fn parse_url(raw: &str) -> Result<Uri, MirrorError> {
    raw.parse()
        .map_err(|_| MirrorError::InvalidUrl(raw.to_string()))
}
