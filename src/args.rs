use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use http::Uri;
use libp2p::Multiaddr;

#[derive(Parser, Debug)]
#[command(about = "Peer-to-peer pull-through mirror for OCI image registries")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write mirror configuration for the container runtime and exit
    Configuration(ConfigurationArgs),
    /// Run the mirror registry
    Registry(RegistryArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConfigurationArgs {
    /// Directory where mirror configuration is written
    #[arg(long, default_value = "/etc/containerd/certs.d")]
    pub registry_config_path: PathBuf,

    /// Registries that are configured to be mirrored
    #[arg(long, required = true, num_args = 1..)]
    pub registries: Vec<Uri>,

    /// Registries that are configured to act as mirrors
    #[arg(long, required = true, num_args = 1..)]
    pub mirror_registries: Vec<Uri>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Address to serve the image registry on
    #[arg(long)]
    pub registry_addr: SocketAddr,

    /// Address to serve the peer router on
    #[arg(long)]
    pub router_addr: SocketAddr,

    /// Address to serve metrics on
    #[arg(long)]
    pub metrics_addr: SocketAddr,

    /// Registries that are configured to be mirrored
    #[arg(long, required = true, num_args = 1..)]
    pub registries: Vec<Uri>,

    /// Inclusive image name filter
    #[arg(long)]
    pub image_filter: Option<String>,

    /// Endpoint of the containerd service
    #[arg(long, default_value = "/run/containerd/containerd.sock")]
    pub containerd_sock: String,

    /// Containerd namespace to fetch images from
    #[arg(long, default_value = "k8s.io")]
    pub containerd_namespace: String,

    /// Static multiaddresses of peers to join the overlay through
    #[arg(long, num_args = 1..)]
    pub bootstrap_peers: Vec<Multiaddr>,

    /// DNS name resolving to peers to join the overlay through
    #[arg(long)]
    pub bootstrap_dns: Option<String>,
}
