//! DirectPV
//!
//! One binary, three roles:
//!
//! ```text
//! directpv node        device discovery, drive/volume reconcilers, CSI node
//! directpv controller  volume scheduling, CSI controller
//! directpv webhook     admission reviews for Drive and Volume records
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Resource;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use directpv::controlplane::{ControllerConfig, ControllerServer, WebhookConfig, WebhookServer};
use directpv::crd::{Drive, Volume};
use directpv::csi::{parse_endpoint, prepare_socket, CsiController, CsiNode, CsiServer, PluginInfo};
use directpv::dispatcher::{Dispatcher, DispatcherConfig};
use directpv::domain::ports::{
    DriveStoreRef, ObjectStore, Runtime, SystemClock, VolumeStoreRef, DEFAULT_SYSCALL_TIMEOUT,
};
use directpv::hardware::discovery::uevent;
use directpv::hardware::mount::{ensure_dir, validate_drive_mounts, MkfsFormatter, SysMounter, XfsQuota};
use directpv::hardware::{DeviceIndex, DeviceScanner, ScannerConfig};
use directpv::labels::{LabelKey, LabelSelector, ValueFilter};
use directpv::node::{DriveReconciler, DriveSync, HostLock, NodeConfig, NodeServer, VolumeReconciler};
use directpv::store::{KubeStore, MemoryStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// DirectPV - node-local storage provisioner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI driver identity
    #[arg(long, env = "DIRECTPV_IDENTITY", default_value = "directpv-min-io", global = true)]
    identity: String,

    /// Kubeconfig for out-of-cluster runs
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Keep records in memory instead of the orchestrator
    #[arg(long, env = "STANDALONE", global = true)]
    standalone: bool,

    /// Reconcile workers per record kind
    #[arg(long, env = "WORKER_THREADS", default_value = "40", global = true)]
    worker_threads: usize,

    /// Full relist interval in seconds
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value = "600", global = true)]
    resync_period_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081", global = true)]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080", global = true)]
    metrics_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node agent
    Node(NodeArgs),
    /// Run the central volume scheduler
    Controller(ControllerArgs),
    /// Run the admission webhook
    Webhook(WebhookArgs),
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    /// Name of this node
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// CSI endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    #[arg(long, env = "DIRECTPV_RACK", default_value = "default")]
    rack: String,

    #[arg(long, env = "DIRECTPV_ZONE", default_value = "default")]
    zone: String,

    #[arg(long, env = "DIRECTPV_REGION", default_value = "default")]
    region: String,

    /// Manage loop devices only
    #[arg(long, env = "LOOPBACK_ONLY")]
    loopback_only: bool,

    /// Root under which drives are mounted
    #[arg(long, env = "DIRECTPV_MOUNT_ROOT", default_value = "/var/lib/directpv/mnt")]
    mount_root: PathBuf,

    /// Kubelet plugin registration root
    #[arg(long, env = "DIRECTPV_PLUGINS_DIR", default_value = "/var/lib/kubelet/plugins")]
    plugins_dir: PathBuf,

    /// Device names to manage (ellipsis or glob); repeatable
    #[arg(long = "drive-filter", env = "DIRECTPV_DRIVE_FILTER", value_delimiter = ',')]
    drive_filter: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// CSI endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,
}

#[derive(clap::Args, Debug)]
struct WebhookArgs {
    /// HTTPS bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:30443")]
    addr: SocketAddr,

    #[arg(long, env = "WEBHOOK_CERT", default_value = "/etc/certs/cert.pem")]
    cert_path: PathBuf,

    #[arg(long, env = "WEBHOOK_KEY", default_value = "/etc/certs/key.pem")]
    key_path: PathBuf,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting DirectPV");
    info!("  Version: {}", directpv::VERSION);
    info!("  Identity: {}", args.identity);
    info!("  Standalone mode: {}", args.standalone);

    let shutdown = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(shutdown.clone());

    let health = tokio::spawn(run_health_server(
        args.health_addr,
        Arc::clone(&ready),
        shutdown.clone(),
    ));
    let metrics = tokio::spawn(run_metrics_server(args.metrics_addr, shutdown.clone()));

    let result = match &args.command {
        Command::Node(node) => run_node(&args, node, shutdown.clone(), Arc::clone(&ready)).await,
        Command::Controller(ctl) => {
            run_controller(&args, ctl, shutdown.clone(), Arc::clone(&ready)).await
        }
        Command::Webhook(hook) => run_webhook(hook, shutdown.clone(), Arc::clone(&ready)).await,
    };

    shutdown.cancel();
    for (name, task) in [("health", health), ("metrics", metrics)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }

    result?;
    info!("DirectPV shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

// =============================================================================
// Stores and Runtime
// =============================================================================

struct Stores {
    drives: DriveStoreRef,
    volumes: VolumeStoreRef,
}

async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            kube::Client::try_from(config).context("building orchestrator client")
        }
        None => kube::Client::try_default()
            .await
            .context("building orchestrator client"),
    }
}

async fn stores(args: &Args) -> anyhow::Result<Stores> {
    if args.standalone {
        info!("using in-memory record store");
        return Ok(Stores {
            drives: MemoryStore::<Drive>::new(),
            volumes: MemoryStore::<Volume>::new(),
        });
    }

    let client = kube_client(args.kubeconfig.as_deref()).await?;
    Ok(Stores {
        drives: Arc::new(KubeStore::<Drive>::new(client.clone())),
        volumes: Arc::new(KubeStore::<Volume>::new(client)),
    })
}

fn host_runtime(stores: Stores) -> Runtime {
    Runtime {
        drives: stores.drives,
        volumes: stores.volumes,
        mounter: Arc::new(SysMounter::new()),
        quota: Arc::new(XfsQuota),
        formatter: Arc::new(MkfsFormatter::default()),
        clock: Arc::new(SystemClock),
        syscall_timeout: DEFAULT_SYSCALL_TIMEOUT,
    }
}

fn dispatcher_config(args: &Args) -> DispatcherConfig {
    DispatcherConfig {
        workers: args.worker_threads,
        resync_period: Duration::from_secs(args.resync_period_secs),
        ..Default::default()
    }
}

/// Run a dispatcher until `shutdown` is cancelled
async fn dispatch<K>(dispatcher: Dispatcher<K>, shutdown: CancellationToken) -> directpv::Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    let stop = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stop.cancel();
    });
    dispatcher.run().await
}

// =============================================================================
// Node Agent
// =============================================================================

async fn run_node(
    args: &Args,
    node: &NodeArgs,
    shutdown: CancellationToken,
    ready: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if node.node_id.is_empty() {
        bail!("--node-id is required");
    }

    let config = Arc::new(NodeConfig {
        node_id: node.node_id.clone(),
        identity: args.identity.clone(),
        rack: node.rack.clone(),
        zone: node.zone.clone(),
        region: node.region.clone(),
        mount_root: node.mount_root.clone(),
        plugins_dir: node.plugins_dir.clone(),
        endpoint: node.endpoint.clone(),
        ..Default::default()
    });
    info!("  Node: {}", config.node_id);
    info!("  Mount root: {}", config.mount_root.display());

    let _lock = HostLock::acquire(&config.mount_root).context("acquiring host lock")?;

    let socket = parse_endpoint(&config.endpoint)?;
    prepare_socket(&socket)?;
    ensure_dir(&config.data_dir())?;

    let rt = host_runtime(stores(args).await?);
    let selector = LabelSelector::everything().with(LabelKey::NODE, config.node_id.as_str());

    // Two drive records backed by one device means the host was tampered with.
    let mount_points: Vec<String> = rt
        .drives
        .list(&selector)
        .await
        .context("listing drives of this node")?
        .into_iter()
        .filter_map(|d| d.status.map(|s| s.mountpoint))
        .filter(|m| !m.is_empty())
        .collect();
    validate_drive_mounts(rt.mounter.as_ref(), &mount_points)?;

    let scanner = DeviceScanner::new(ScannerConfig {
        loopback_only: node.loopback_only,
        device_filter: ValueFilter::parse(&node.drive_filter)?,
        ..Default::default()
    });
    let index = DeviceIndex::new();
    let reader = index.reader();
    let enumerate = scanner.clone();
    let facts = tokio::task::spawn_blocking(move || enumerate.enumerate())
        .await
        .context("device enumeration task")??;
    index.replace_all(facts);

    let mut tasks: JoinSet<directpv::Result<()>> = JoinSet::new();
    tasks.spawn(watch_devices(scanner, index, shutdown.clone()));
    tasks.spawn(DriveSync::new(rt.clone(), Arc::clone(&config)).run(reader, shutdown.clone()));

    let drives = Dispatcher::new(
        rt.drives.clone(),
        Arc::new(DriveReconciler::new(rt.clone(), Arc::clone(&config))),
        dispatcher_config(args),
    )
    .with_selector(selector.clone());
    tasks.spawn(dispatch(drives, shutdown.clone()));

    let volumes = Dispatcher::new(
        rt.volumes.clone(),
        Arc::new(VolumeReconciler::new(rt.clone(), Arc::clone(&config))),
        dispatcher_config(args),
    )
    .with_selector(selector);
    tasks.spawn(dispatch(volumes, shutdown.clone()));

    let csi = Arc::new(NodeServer::new(rt, Arc::clone(&config)));
    let listener = CsiServer::bind(&socket)?;
    info!(
        endpoint = %socket.display(),
        node_id = %csi.get_info().node_id,
        capabilities = ?csi.get_capabilities(),
        "CSI node service ready"
    );
    let server = CsiServer::new(plugin_info(args)).with_node(csi);
    tasks.spawn(Arc::new(server).serve_on(listener, shutdown.clone()));
    ready.store(true, Ordering::Release);

    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "node agent task failed");
                failed = true;
                shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "node agent task panicked");
                failed = true;
                shutdown.cancel();
            }
        }
    }
    if failed {
        bail!("node agent stopped after a task failure");
    }
    Ok(())
}

/// Feed kernel device events into the index until shutdown
async fn watch_devices(
    scanner: DeviceScanner,
    index: DeviceIndex,
    shutdown: CancellationToken,
) -> directpv::Result<()> {
    match uevent::watch(scanner) {
        Ok(mut events) => loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => index.apply(event),
                    Some(Err(e)) => warn!(error = %e, "device event dropped"),
                    None => {
                        warn!("device event stream ended; hot-plug changes need a restart");
                        break;
                    }
                },
            }
        },
        Err(e) => warn!(error = %e, "device event watch unavailable; hot-plug changes need a restart"),
    }

    // The index stays alive for its readers until shutdown.
    shutdown.cancelled().await;
    Ok(())
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(
    args: &Args,
    ctl: &ControllerArgs,
    shutdown: CancellationToken,
    ready: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let socket = parse_endpoint(&ctl.endpoint)?;
    prepare_socket(&socket)?;

    let rt = host_runtime(stores(args).await?);
    let controller = Arc::new(ControllerServer::new(
        rt,
        ControllerConfig {
            identity: args.identity.clone(),
        },
    ));
    let listener = CsiServer::bind(&socket)?;
    info!(
        endpoint = %socket.display(),
        identity = %controller.config().identity,
        capabilities = ?controller.get_capabilities(),
        "CSI controller service ready"
    );
    let server = CsiServer::new(plugin_info(args)).with_controller(controller);
    ready.store(true, Ordering::Release);

    Arc::new(server).serve_on(listener, shutdown).await?;
    Ok(())
}

fn plugin_info(args: &Args) -> PluginInfo {
    PluginInfo {
        name: args.identity.clone(),
        vendor_version: directpv::VERSION.to_string(),
    }
}

// =============================================================================
// Webhook
// =============================================================================

async fn run_webhook(
    hook: &WebhookArgs,
    shutdown: CancellationToken,
    ready: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let server = WebhookServer::new(WebhookConfig {
        addr: hook.addr,
        cert_path: hook.cert_path.clone(),
        key_path: hook.key_path.clone(),
        ..Default::default()
    });
    ready.store(true, Ordering::Release);
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> directpv::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = Arc::clone(&ready);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
                        "/readyz" if ready.load(Ordering::Acquire) => text(StatusCode::OK, "ok"),
                        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| directpv::Error::Configuration(format!("Health server bind {}: {}", addr, e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| directpv::Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> directpv::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register before the first scrape.
    directpv::metrics::metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = text(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| directpv::Error::Configuration(format!("Metrics server bind {}: {}", addr, e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| directpv::Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
