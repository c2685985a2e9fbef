//! In-memory fakes for the collaborator contracts, used across unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::oci::{Digest, EventStream, OciClient, OciError, OciEvent};
use crate::reference::Reference;
use crate::routing::{Resolution, Router};

/// Content store fake backed by hash maps.
#[derive(Default)]
pub struct MemoryOciClient {
    manifests: HashMap<String, (Vec<u8>, String)>,
    blobs: HashMap<String, Vec<u8>>,
    references: HashMap<String, String>,
    events: Mutex<VecDeque<Vec<Result<OciEvent, OciError>>>>,
    subscribes: AtomicUsize,
}

impl MemoryOciClient {
    pub fn with_manifest(mut self, digest: &str, bytes: Vec<u8>, media_type: &str) -> Self {
        self.manifests
            .insert(digest.to_string(), (bytes, media_type.to_string()));
        self
    }

    pub fn with_blob(mut self, digest: &str, bytes: Vec<u8>) -> Self {
        self.blobs.insert(digest.to_string(), bytes);
        self
    }

    pub fn with_reference(mut self, name: &str, digest: &str) -> Self {
        self.references
            .insert(name.to_string(), digest.to_string());
        self
    }

    /// Queue one batch of events for the next `subscribe` call. Later calls
    /// get an immediately ending stream.
    pub fn with_events(self, events: Vec<Result<OciEvent, OciError>>) -> Self {
        self.events.lock().unwrap().push_back(events);
        self
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OciClient for MemoryOciClient {
    async fn list(&self) -> Result<(Vec<Digest>, Vec<Reference>), OciError> {
        let digests = self
            .manifests
            .keys()
            .chain(self.blobs.keys())
            .map(|raw| Digest::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let references = self
            .references
            .keys()
            .map(|name| Reference::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((digests, references))
    }

    async fn subscribe(&self) -> Result<EventStream, OciError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().unwrap().pop_front().unwrap_or_default();
        Ok(futures::stream::iter(events).boxed())
    }

    async fn resolve(&self, reference: &Reference) -> Result<Digest, OciError> {
        let digest = self
            .references
            .get(&reference.to_string())
            .ok_or_else(|| OciError::NotFound(reference.to_string()))?;
        Digest::parse(digest)
    }

    async fn get_content(&self, digest: &Digest) -> Result<(Vec<u8>, String), OciError> {
        self.manifests
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| OciError::NotFound(digest.to_string()))
    }

    async fn get_size(&self, digest: &Digest) -> Result<i64, OciError> {
        let key = digest.to_string();
        self.blobs
            .get(&key)
            .map(|bytes| bytes.len() as i64)
            .or_else(|| self.manifests.get(&key).map(|(bytes, _)| bytes.len() as i64))
            .ok_or(OciError::NotFound(key))
    }

    async fn copy(
        &self,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), OciError> {
        let bytes = self
            .blobs
            .get(&digest.to_string())
            .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
        for chunk in bytes.chunks(4096) {
            writer.write_all(chunk).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

/// Router fake that records calls and answers from a fixed table.
#[derive(Default)]
pub struct MemoryRouter {
    advertised: Mutex<Vec<String>>,
    resolutions: HashMap<String, Resolution>,
    resolve_calls: Mutex<Vec<(String, bool)>>,
    advertises: AtomicUsize,
    unresponsive: bool,
}

impl MemoryRouter {
    pub fn with_resolution(mut self, key: &str, resolution: Resolution) -> Self {
        self.resolutions.insert(key.to_string(), resolution);
        self
    }

    /// A router that never answers, for exercising resolve deadlines.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    pub fn advertised(&self) -> Vec<String> {
        self.advertised.lock().unwrap().clone()
    }

    pub fn advertise_calls(&self) -> usize {
        self.advertises.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> Vec<(String, bool)> {
        self.resolve_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn advertise(&self, keys: Vec<String>) {
        self.advertises.fetch_add(1, Ordering::SeqCst);
        self.advertised.lock().unwrap().extend(keys);
    }

    async fn resolve(&self, key: &str, allow_self: bool) -> Option<Resolution> {
        self.resolve_calls
            .lock()
            .unwrap()
            .push((key.to_string(), allow_self));
        if self.unresponsive {
            futures::future::pending::<()>().await;
        }
        self.resolutions.get(key).copied()
    }

    async fn close(&self) {}
}
