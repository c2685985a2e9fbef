//! Reconciles the local content store into router advertisements.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::oci::{EventStream, OciClient, OciEvent};
use crate::routing::Router;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Keep the router's view of this node in sync with the content store:
/// advertise a full snapshot, then react to change events, resubscribing
/// with backoff when the event stream fails. Runs until the task is
/// dropped; removals are left to age out of the overlay.
pub async fn track(oci: Arc<dyn OciClient>, router: Arc<dyn Router>) {
    let mut delay = BACKOFF_MIN;
    loop {
        match advertise_inventory(oci.as_ref(), router.as_ref()).await {
            Ok(mut events) => {
                delay = BACKOFF_MIN;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(OciEvent::Added(key)) => {
                            debug!(key, "advertising added content");
                            router.advertise(vec![key]).await;
                        }
                        Ok(OciEvent::Removed(key)) => {
                            debug!(key, "content removed, advertisement will age out");
                        }
                        Err(err) => {
                            warn!(%err, "event stream failed");
                            break;
                        }
                    }
                }
                warn!("event stream ended, resubscribing");
            }
            Err(err) => warn!(%err, "could not reconcile inventory"),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(BACKOFF_MAX);
    }
}

/// Subscribe first, then snapshot, so changes racing the snapshot are not
/// lost; advertising twice is harmless.
async fn advertise_inventory(
    oci: &dyn OciClient,
    router: &dyn Router,
) -> Result<EventStream, crate::oci::OciError> {
    let events = oci.subscribe().await?;
    let (digests, references) = oci.list().await?;
    let keys: Vec<String> = digests
        .iter()
        .map(|digest| digest.to_string())
        .chain(references.iter().map(|reference| reference.to_string()))
        .collect();
    info!(keys = keys.len(), "advertising local inventory");
    router.advertise(keys).await;
    Ok(events)
}
