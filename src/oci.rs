//! Access to the local containerd content store.
//!
//! The [`OciClient`] trait is the seam between the serving plane and the
//! container runtime: it lists what is resident, resolves tags, reads
//! manifests, streams blobs and surfaces image events. [`ContainerdClient`]
//! implements it over containerd's gRPC API, scoped to a single namespace.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Envelope, GetImageRequest, InfoRequest, ListImagesRequest, ReadContentRequest,
    SubscribeRequest,
};
use containerd_client::tonic::metadata::{Ascii, MetadataValue};
use containerd_client::tonic::transport::Channel;
use containerd_client::tonic::{Code, Request, Status, Streaming};
use futures::stream::BoxStream;
use futures::StreamExt;
use http::Uri;
use once_cell::sync::Lazy;
use prost::Message;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::reference::Reference;

/// Fallback media type for manifests that do not embed one.
const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

pub type EventStream = BoxStream<'static, Result<OciEvent, OciError>>;

#[derive(Debug, Error)]
pub enum OciError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    #[error("invalid reference {0:?}")]
    InvalidReference(String),

    #[error("could not connect to containerd: {0}")]
    Connect(String),

    #[error("containerd request failed: {0}")]
    Grpc(Status),

    #[error("could not parse manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<Status> for OciError {
    fn from(status: Status) -> Self {
        if status.code() == Code::NotFound {
            Self::NotFound(status.message().to_string())
        } else {
            Self::Grpc(status)
        }
    }
}

impl OciError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

static DIGEST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new("^([a-z0-9]+(?:[.+_-][a-z0-9]+)*):([a-f0-9]{32,})$").unwrap());

/// An algorithm-prefixed content hash, e.g. `sha256:e3b0c442…`. The unique,
/// immutable identifier of a manifest or blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    pub fn parse(s: &str) -> Result<Self, OciError> {
        let captures = DIGEST_REGEX
            .captures(s)
            .ok_or_else(|| OciError::InvalidDigest(s.to_string()))?;
        let algorithm = captures[1].to_string();
        let encoded = captures[2].to_string();
        let valid = match algorithm.as_str() {
            "sha256" => encoded.len() == 64,
            "sha512" => encoded.len() == 128,
            _ => true,
        };
        if !valid {
            return Err(OciError::InvalidDigest(s.to_string()));
        }
        Ok(Self { algorithm, encoded })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A change observed in the content store. Keys are advertisement keys:
/// digest strings or full reference strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OciEvent {
    Added(String),
    Removed(String),
}

/// Read-only access to the local content store. A digest seen in `list` or
/// in an `Added` event stays addressable until a matching `Removed` event is
/// observed; callers may race the runtime's garbage collector beyond that.
#[async_trait]
pub trait OciClient: Send + Sync {
    /// Current inventory snapshot: resident digests and tag-references,
    /// filtered to the configured registries and image filter.
    async fn list(&self) -> Result<(Vec<Digest>, Vec<Reference>), OciError>;

    /// Lazy, restartable stream of change events. Events may be coalesced
    /// but are never reordered for a single key.
    async fn subscribe(&self) -> Result<EventStream, OciError>;

    /// Map a tag-reference to the digest it currently points at.
    async fn resolve(&self, reference: &Reference) -> Result<Digest, OciError>;

    /// Manifest bytes and media type.
    async fn get_content(&self, digest: &Digest) -> Result<(Vec<u8>, String), OciError>;

    /// Blob size in bytes.
    async fn get_size(&self, digest: &Digest) -> Result<i64, OciError>;

    /// Stream a blob into `writer` without buffering it whole.
    async fn copy(
        &self,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), OciError>;
}

/// Which image names this node tracks: the name must belong to one of the
/// mirrored registries and pass the optional inclusive filter.
#[derive(Debug, Clone)]
pub struct ImageSelection {
    registry_hosts: Vec<String>,
    image_filter: Option<Regex>,
}

impl ImageSelection {
    pub fn new(registries: &[Uri], image_filter: Option<Regex>) -> Self {
        let registry_hosts = registries
            .iter()
            .filter_map(|uri| uri.authority())
            .map(|authority| authority.as_str().to_string())
            .collect();
        Self {
            registry_hosts,
            image_filter,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let host_matches = self.registry_hosts.is_empty()
            || self.registry_hosts.iter().any(|host| {
                name.strip_prefix(host.as_str())
                    .map(|rest| rest.starts_with('/'))
                    .unwrap_or(false)
            });
        if !host_matches {
            return false;
        }
        match &self.image_filter {
            Some(filter) => filter.is_match(name),
            None => true,
        }
    }
}

/// [`OciClient`] over containerd's gRPC API.
#[derive(Clone)]
pub struct ContainerdClient {
    channel: Channel,
    namespace: String,
    namespace_value: MetadataValue<Ascii>,
    selection: ImageSelection,
}

impl ContainerdClient {
    /// Connect to containerd and verify the connection, so a bad socket is
    /// a startup failure rather than a per-request one.
    pub async fn connect(
        socket: &str,
        namespace: &str,
        selection: ImageSelection,
    ) -> Result<Self, OciError> {
        let namespace_value = namespace
            .parse()
            .map_err(|_| OciError::Connect(format!("invalid namespace {namespace:?}")))?;
        let channel = containerd_client::connect(socket)
            .await
            .map_err(|err| OciError::Connect(err.to_string()))?;
        let client = Self {
            channel,
            namespace: namespace.to_string(),
            namespace_value,
            selection,
        };
        let version = VersionClient::new(client.channel.clone())
            .version(())
            .await?
            .into_inner();
        info!(version = %version.version, namespace, "connected to containerd");
        Ok(client)
    }

    fn scoped<T>(&self, request: T) -> Request<T> {
        let mut request = Request::new(request);
        request
            .metadata_mut()
            .insert("containerd-namespace", self.namespace_value.clone());
        request
    }

    async fn read_all(&self, digest: &Digest) -> Result<Vec<u8>, OciError> {
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let mut stream = ContentClient::new(self.channel.clone())
            .read(self.scoped(request))
            .await?
            .into_inner();
        let mut bytes = Vec::new();
        while let Some(response) = stream.message().await? {
            bytes.extend_from_slice(&response.data);
        }
        Ok(bytes)
    }

    /// Walk an image's manifests starting at `root`, collecting every digest
    /// whose content is locally resident. Platform manifests of a
    /// multi-arch index that were never pulled are skipped.
    async fn collect_image_digests(&self, root: &Digest) -> Result<Vec<Digest>, OciError> {
        let mut seen = HashSet::new();
        let mut digests = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(digest) = queue.pop_front() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let bytes = match self.read_all(&digest).await {
                Ok(bytes) => bytes,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            let doc: ManifestDoc = serde_json::from_slice(&bytes).unwrap_or_default();
            digests.push(digest);
            for descriptor in doc.manifests.unwrap_or_default() {
                queue.push_back(Digest::parse(&descriptor.digest)?);
            }
            for descriptor in doc.config.into_iter().chain(doc.layers.unwrap_or_default()) {
                let blob = Digest::parse(&descriptor.digest)?;
                if !seen.insert(blob.clone()) {
                    continue;
                }
                if self.get_size(&blob).await.is_ok() {
                    digests.push(blob);
                }
            }
        }
        Ok(digests)
    }

    async fn envelope_to_events(&self, envelope: Envelope) -> Vec<Result<OciEvent, OciError>> {
        if envelope.namespace != self.namespace {
            return Vec::new();
        }
        let Some(any) = envelope.event else {
            return Vec::new();
        };
        let payload = match ImageEventPayload::decode(any.value.as_slice()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic = %envelope.topic, %err, "could not decode image event");
                return Vec::new();
            }
        };
        match envelope.topic.as_str() {
            "/images/create" | "/images/update" => {
                if !self.selection.matches(&payload.name) {
                    return Vec::new();
                }
                let reference = match Reference::parse(&payload.name) {
                    Ok(reference) => reference,
                    Err(err) => {
                        debug!(name = %payload.name, %err, "skipping unparseable image name");
                        return Vec::new();
                    }
                };
                let mut events = vec![Ok(OciEvent::Added(reference.to_string()))];
                match self.resolve(&reference).await {
                    Ok(digest) => match self.collect_image_digests(&digest).await {
                        Ok(digests) => events.extend(
                            digests
                                .into_iter()
                                .map(|digest| Ok(OciEvent::Added(digest.to_string()))),
                        ),
                        Err(err) => events.push(Err(err)),
                    },
                    // The image can disappear between the event and the
                    // lookup; the delete event will follow.
                    Err(err) if err.is_not_found() => {}
                    Err(err) => events.push(Err(err)),
                }
                events
            }
            "/images/delete" => vec![Ok(OciEvent::Removed(payload.name))],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl OciClient for ContainerdClient {
    async fn list(&self) -> Result<(Vec<Digest>, Vec<Reference>), OciError> {
        let response = ImagesClient::new(self.channel.clone())
            .list(self.scoped(ListImagesRequest::default()))
            .await?
            .into_inner();
        let mut digests = Vec::new();
        let mut references = Vec::new();
        for image in response.images {
            if !self.selection.matches(&image.name) {
                continue;
            }
            let reference = match Reference::parse(&image.name) {
                Ok(reference) => reference,
                Err(err) => {
                    debug!(name = %image.name, %err, "skipping unparseable image name");
                    continue;
                }
            };
            let Some(target) = image.target else {
                continue;
            };
            let root = match Digest::parse(&target.digest) {
                Ok(digest) => digest,
                Err(err) => {
                    debug!(name = %image.name, %err, "skipping image with invalid target");
                    continue;
                }
            };
            match self.collect_image_digests(&root).await {
                Ok(image_digests) => {
                    references.push(reference);
                    digests.extend(image_digests);
                }
                Err(err) => warn!(name = %image.name, %err, "could not walk image manifests"),
            }
        }
        Ok((digests, references))
    }

    async fn subscribe(&self) -> Result<EventStream, OciError> {
        let request = SubscribeRequest {
            filters: vec![
                "topic~=\"/images/create\"".to_string(),
                "topic~=\"/images/update\"".to_string(),
                "topic~=\"/images/delete\"".to_string(),
            ],
        };
        let stream = EventsClient::new(self.channel.clone())
            .subscribe(self.scoped(request))
            .await?
            .into_inner();
        let state = SubscribeState {
            stream: Some(stream),
            client: self.clone(),
            buffered: VecDeque::new(),
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffered.pop_front() {
                    return Some((event, state));
                }
                let stream = state.stream.as_mut()?;
                match stream.message().await {
                    Ok(Some(envelope)) => {
                        let events = state.client.envelope_to_events(envelope).await;
                        state.buffered.extend(events);
                    }
                    Ok(None) => {
                        state.stream = None;
                    }
                    Err(status) => {
                        state.stream = None;
                        state.buffered.push_back(Err(status.into()));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn resolve(&self, reference: &Reference) -> Result<Digest, OciError> {
        let request = GetImageRequest {
            name: reference.to_string(),
        };
        let response = ImagesClient::new(self.channel.clone())
            .get(self.scoped(request))
            .await?
            .into_inner();
        let target = response
            .image
            .and_then(|image| image.target)
            .ok_or_else(|| OciError::NotFound(reference.to_string()))?;
        Digest::parse(&target.digest)
    }

    async fn get_content(&self, digest: &Digest) -> Result<(Vec<u8>, String), OciError> {
        let bytes = self.read_all(digest).await?;
        let doc: ManifestDoc = serde_json::from_slice(&bytes).unwrap_or_default();
        let media_type = doc
            .media_type
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
        Ok((bytes, media_type))
    }

    async fn get_size(&self, digest: &Digest) -> Result<i64, OciError> {
        let request = InfoRequest {
            digest: digest.to_string(),
        };
        let response = ContentClient::new(self.channel.clone())
            .info(self.scoped(request))
            .await?
            .into_inner();
        let info = response
            .info
            .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
        Ok(info.size)
    }

    async fn copy(
        &self,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), OciError> {
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let mut stream = ContentClient::new(self.channel.clone())
            .read(self.scoped(request))
            .await?
            .into_inner();
        while let Some(response) = stream.message().await? {
            writer.write_all(&response.data).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

struct SubscribeState {
    stream: Option<Streaming<Envelope>>,
    client: ContainerdClient,
    buffered: VecDeque<Result<OciEvent, OciError>>,
}

/// `containerd.events.ImageCreate`, `ImageUpdate` and `ImageDelete` all
/// carry the image name in field 1, the only field consumed here.
#[derive(Clone, PartialEq, Message)]
struct ImageEventPayload {
    #[prost(string, tag = "1")]
    name: String,
}

/// The subset of manifest and index documents needed to walk an image:
/// nested manifests descend, config and layers are leaves.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ManifestDoc {
    media_type: Option<String>,
    manifests: Option<Vec<DescriptorDoc>>,
    config: Option<DescriptorDoc>,
    layers: Option<Vec<DescriptorDoc>>,
}

#[derive(Debug, Deserialize)]
struct DescriptorDoc {
    digest: String,
}
