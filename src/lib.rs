//! Peer-to-peer pull-through mirror for OCI image registries.
//!
//! Each cluster node runs this service as a sidecar. The container runtime is
//! configured to send registry requests here first; content another node has
//! already pulled is served over the local network instead of being fetched
//! from the upstream registry again. Content is located by cryptographic
//! digest through a distributed peer directory, and a miss is answered with
//! 404 so the runtime falls back to the upstream registry on its own.

use thiserror::Error;

pub mod args;
pub mod headers;
pub mod metrics;
pub mod mirror;
pub mod oci;
pub mod reference;
pub mod registry;
pub mod routing;
pub mod state;

#[cfg(test)]
pub mod test_utils;

/// Process-level errors. Anything that reaches `main` through this type
/// causes a non-zero exit; request-level failures never do (the registry
/// handler answers 404 instead).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Oci(#[from] oci::OciError),

    #[error(transparent)]
    Routing(#[from] routing::RoutingError),

    #[error(transparent)]
    Mirror(#[from] mirror::MirrorError),

    #[error("invalid image filter: {0}")]
    ImageFilter(#[from] regex::Error),

    #[error(transparent)]
    Server(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
