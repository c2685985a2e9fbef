//! Content-addressable peer routing.
//!
//! The [`Router`] is a distributed directory, not a cache: it maps
//! advertisement keys to the peers that can serve them. [`P2pRouter`]
//! implements it with a Kademlia overlay: advertising starts a provider
//! record, resolving queries providers and maps them to routable addresses
//! learned through the identify protocol. The swarm lives in its own task
//! and is reached exclusively through a command channel.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::identify;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{self, GetProvidersOk, ProgressStep, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{Multiaddr, PeerId};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "/reflector/1.0.0";
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const SEED_RETRY_MIN: Duration = Duration::from_secs(1);
const SEED_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("overlay error: {0}")]
    Overlay(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful resolve: another node, or this one (only ever
/// returned when the caller allowed it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Local,
    Peer(IpAddr),
}

/// A content-addressable peer directory. Keys are opaque bytes.
#[async_trait]
pub trait Router: Send + Sync {
    /// Declare that this node can serve `keys`. Idempotent and additive.
    /// A no-op after [`close`](Router::close).
    async fn advertise(&self, keys: Vec<String>);

    /// One peer advertising `key`, or `None`. Must return `None` rather than
    /// block past the caller's deadline, and never resolves to this node
    /// unless `allow_self` is set.
    async fn resolve(&self, key: &str, allow_self: bool) -> Option<Resolution>;

    /// Quiesce the overlay. Subsequent calls are no-ops.
    async fn close(&self);
}

/// One-shot source of seed addresses for joining the overlay.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn get(&self) -> Result<Vec<Multiaddr>, RoutingError>;
}

/// Seeds from a fixed peer list.
pub struct StaticBootstrapper {
    peers: Vec<Multiaddr>,
}

impl StaticBootstrapper {
    pub fn new(peers: Vec<Multiaddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Bootstrapper for StaticBootstrapper {
    async fn get(&self) -> Result<Vec<Multiaddr>, RoutingError> {
        Ok(self.peers.clone())
    }
}

/// Seeds by resolving a DNS name, e.g. a headless cluster service that
/// returns every running sidecar.
pub struct DnsBootstrapper {
    host: String,
    port: u16,
}

impl DnsBootstrapper {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

#[async_trait]
impl Bootstrapper for DnsBootstrapper {
    async fn get(&self) -> Result<Vec<Multiaddr>, RoutingError> {
        let addresses = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .map(|address| multiaddr_from(&address))
            .collect();
        Ok(addresses)
    }
}

#[derive(NetworkBehaviour)]
struct RouterBehaviour {
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

enum RouterCommand {
    Advertise {
        keys: Vec<String>,
    },
    Resolve {
        key: String,
        allow_self: bool,
        tx: oneshot::Sender<Option<Resolution>>,
    },
    Dial {
        address: Multiaddr,
    },
    Close {
        tx: oneshot::Sender<()>,
    },
}

/// [`Router`] over a Kademlia overlay.
pub struct P2pRouter {
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl P2pRouter {
    pub async fn new(
        addr: SocketAddr,
        bootstrapper: Arc<dyn Bootstrapper>,
    ) -> Result<Self, RoutingError> {
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default().nodelay(true),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|err| RoutingError::Overlay(err.to_string()))?
            .with_behaviour(|key| {
                let peer_id = PeerId::from(key.public());
                let mut config = kad::Config::default();
                config.set_query_timeout(QUERY_TIMEOUT);
                let mut kademlia =
                    kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), config);
                kademlia.set_mode(Some(kad::Mode::Server));
                let identify = identify::Behaviour::new(identify::Config::new(
                    PROTOCOL_VERSION.to_string(),
                    key.public(),
                ));
                RouterBehaviour { kademlia, identify }
            })
            .map_err(|err| RoutingError::Overlay(err.to_string()))?
            .with_swarm_config(|config| config.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let local_peer_id = *swarm.local_peer_id();
        swarm
            .listen_on(multiaddr_from(&addr))
            .map_err(|err| RoutingError::Overlay(err.to_string()))?;
        info!(%local_peer_id, %addr, "router listening");

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = SwarmTask {
            swarm,
            local_peer_id,
            commands: receiver,
            peer_addresses: HashMap::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(task.run());
        tokio::spawn(seed(bootstrapper, commands.clone()));

        Ok(Self { commands })
    }
}

#[async_trait]
impl Router for P2pRouter {
    async fn advertise(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        let _ = self.commands.send(RouterCommand::Advertise { keys });
    }

    async fn resolve(&self, key: &str, allow_self: bool) -> Option<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::Resolve {
                key: key.to_string(),
                allow_self,
                tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RouterCommand::Close { tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Fetch seed addresses until the bootstrapper returns any, then dial them.
async fn seed(bootstrapper: Arc<dyn Bootstrapper>, commands: mpsc::UnboundedSender<RouterCommand>) {
    let mut delay = SEED_RETRY_MIN;
    loop {
        match bootstrapper.get().await {
            Ok(addresses) if !addresses.is_empty() => {
                for address in addresses {
                    if commands.send(RouterCommand::Dial { address }).is_err() {
                        return;
                    }
                }
                return;
            }
            Ok(_) => debug!("bootstrapper returned no peers yet"),
            Err(err) => warn!(%err, "could not fetch bootstrap peers"),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(SEED_RETRY_MAX);
    }
}

struct PendingResolve {
    allow_self: bool,
    tx: Option<oneshot::Sender<Option<Resolution>>>,
}

struct SwarmTask {
    swarm: Swarm<RouterBehaviour>,
    local_peer_id: PeerId,
    commands: mpsc::UnboundedReceiver<RouterCommand>,
    peer_addresses: HashMap<PeerId, IpAddr>,
    pending: HashMap<QueryId, PendingResolve>,
}

impl SwarmTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(RouterCommand::Advertise { keys }) => self.advertise(keys),
                    Some(RouterCommand::Resolve { key, allow_self, tx }) => {
                        self.start_resolve(&key, allow_self, tx)
                    }
                    Some(RouterCommand::Dial { address }) => self.dial(address),
                    Some(RouterCommand::Close { tx }) => {
                        let _ = tx.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("router task stopped");
    }

    fn advertise(&mut self, keys: Vec<String>) {
        for key in keys {
            if let Err(err) = self
                .swarm
                .behaviour_mut()
                .kademlia
                .start_providing(record_key(&key))
            {
                warn!(key, %err, "could not advertise key");
            }
        }
    }

    fn start_resolve(
        &mut self,
        key: &str,
        allow_self: bool,
        tx: oneshot::Sender<Option<Resolution>>,
    ) {
        let id = self
            .swarm
            .behaviour_mut()
            .kademlia
            .get_providers(record_key(key));
        self.pending.insert(
            id,
            PendingResolve {
                allow_self,
                tx: Some(tx),
            },
        );
    }

    fn dial(&mut self, address: Multiaddr) {
        debug!(%address, "dialing bootstrap peer");
        if let Err(err) = self.swarm.dial(address) {
            warn!(%err, "could not dial bootstrap peer");
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<RouterBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(%address, "new listen address");
            }
            SwarmEvent::Behaviour(RouterBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for address in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, address.clone());
                }
                let ip = info
                    .listen_addrs
                    .iter()
                    .filter_map(ip_of)
                    .find(|ip| !ip.is_loopback())
                    .or_else(|| info.listen_addrs.iter().filter_map(ip_of).next());
                if let Some(ip) = ip {
                    if self.peer_addresses.insert(peer_id, ip).is_none() {
                        debug!(%peer_id, %ip, "learned peer address");
                        let _ = self.swarm.behaviour_mut().kademlia.bootstrap();
                    }
                }
            }
            SwarmEvent::Behaviour(RouterBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    id, result, step, ..
                },
            )) => self.handle_query_progress(id, result, step),
            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: QueryId, result: QueryResult, step: ProgressStep) {
        let Some(pending) = self.pending.get(&id) else {
            return;
        };
        let allow_self = pending.allow_self;
        match result {
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                let resolution = providers.into_iter().find_map(|provider| {
                    if provider == self.local_peer_id {
                        allow_self.then_some(Resolution::Local)
                    } else {
                        self.peer_addresses
                            .get(&provider)
                            .map(|ip| Resolution::Peer(*ip))
                    }
                });
                if let Some(resolution) = resolution {
                    self.finish_resolve(&id, Some(resolution));
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                } else if step.last {
                    self.finish_resolve(&id, None);
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            })) => self.finish_resolve(&id, None),
            QueryResult::GetProviders(Err(err)) => {
                debug!(%err, "provider lookup failed");
                self.finish_resolve(&id, None);
            }
            _ => {
                if step.last {
                    self.pending.remove(&id);
                }
            }
        }
    }

    fn finish_resolve(&mut self, id: &QueryId, resolution: Option<Resolution>) {
        if let Some(mut pending) = self.pending.remove(id) {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(resolution);
            }
        }
    }
}

/// Advertisement keys are arbitrary strings; hash them into fixed-size
/// record keys so tags and digests route alike.
fn record_key(key: &str) -> RecordKey {
    let hash = Sha256::digest(key.as_bytes());
    let multihash = multihash::Multihash::<64>::wrap(0x12, &hash)
        .expect("a sha256 digest always fits in a multihash");
    RecordKey::new(&multihash.to_bytes())
}

fn multiaddr_from(addr: &SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port()))
}

fn ip_of(address: &Multiaddr) -> Option<IpAddr> {
    address.iter().find_map(|protocol| match protocol {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}
