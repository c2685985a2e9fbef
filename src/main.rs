use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use reflector::args::{Args, Commands, ConfigurationArgs, RegistryArgs};
use reflector::oci::{ContainerdClient, ImageSelection, OciClient};
use reflector::routing::{Bootstrapper, DnsBootstrapper, P2pRouter, Router, StaticBootstrapper};
use reflector::{metrics, mirror, registry, state, Error};

/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap(),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    match run(args).await {
        Ok(()) => {
            info!("gracefully shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Commands::Configuration(args) => configuration(args).await,
        Commands::Registry(args) => serve(args).await,
    }
}

async fn configuration(args: ConfigurationArgs) -> Result<(), Error> {
    mirror::add_mirror_configuration(
        &args.registry_config_path,
        &args.registries,
        &args.mirror_registries,
    )
    .await?;
    Ok(())
}

async fn serve(args: RegistryArgs) -> Result<(), Error> {
    let image_filter = args
        .image_filter
        .as_deref()
        .map(Regex::new)
        .transpose()?;
    let selection = ImageSelection::new(&args.registries, image_filter);
    let oci = Arc::new(
        ContainerdClient::connect(&args.containerd_sock, &args.containerd_namespace, selection)
            .await?,
    );

    let bootstrapper: Arc<dyn Bootstrapper> = if !args.bootstrap_peers.is_empty() {
        Arc::new(StaticBootstrapper::new(args.bootstrap_peers.clone()))
    } else if let Some(host) = &args.bootstrap_dns {
        Arc::new(DnsBootstrapper::new(host.clone(), args.router_addr.port()))
    } else {
        Arc::new(StaticBootstrapper::new(Vec::new()))
    };
    let router = Arc::new(P2pRouter::new(args.router_addr, bootstrapper).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    {
        let oci = Arc::clone(&oci) as Arc<dyn OciClient>;
        let router = Arc::clone(&router) as Arc<dyn Router>;
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = state::track(oci, router) => Ok(()),
                _ = shutdown.changed() => Ok(()),
            }
        });
    }

    {
        let server = axum::Server::try_bind(&args.metrics_addr)?
            .serve(metrics::make_router().into_make_service());
        let mut drain = shutdown_rx.clone();
        spawn_server(
            &mut tasks,
            server.with_graceful_shutdown(async move {
                let _ = drain.changed().await;
            }),
            shutdown_rx.clone(),
        );
    }

    let registry_state = Arc::new(registry::RegistryState {
        oci: Arc::clone(&oci) as Arc<dyn OciClient>,
        router: Arc::clone(&router) as Arc<dyn Router>,
        registry_port: args.registry_addr.port(),
    });
    {
        let server = axum::Server::try_bind(&args.registry_addr)?.serve(
            registry::make_router(registry_state)
                .into_make_service_with_connect_info::<SocketAddr>(),
        );
        let mut drain = shutdown_rx.clone();
        spawn_server(
            &mut tasks,
            server.with_graceful_shutdown(async move {
                let _ = drain.changed().await;
            }),
            shutdown_rx.clone(),
        );
    }
    info!(addr = %args.registry_addr, "running registry");

    let mut signal_task = tokio::spawn(wait_for_signal());
    let mut signalled = false;
    let mut first_error = None;
    loop {
        tokio::select! {
            _ = &mut signal_task, if !signalled => {
                signalled = true;
                info!("shutdown signal received");
                let _ = shutdown_tx.send(());
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(result) => {
                    let result = result.unwrap_or_else(|err| {
                        Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
                    });
                    if let Err(err) = result {
                        error!(%err, "component failed");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        let _ = shutdown_tx.send(());
                    }
                }
            },
        }
    }
    signal_task.abort();
    router.close().await;

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run a listener until it drains after shutdown, for at most
/// [`SHUTDOWN_GRACE`] past the signal.
fn spawn_server(
    tasks: &mut JoinSet<Result<(), Error>>,
    server: impl std::future::Future<Output = Result<(), hyper::Error>> + Send + 'static,
    mut shutdown: watch::Receiver<()>,
) {
    tasks.spawn(async move {
        tokio::select! {
            result = server => result.map_err(Error::from),
            _ = async {
                let _ = shutdown.changed().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => Ok(()),
        }
    });
}

async fn wait_for_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("installing a signal handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
