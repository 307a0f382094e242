//! Block Array CSI Driver
//!
//! Serves the CSI Identity and Controller services for a block-storage
//! array.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use array_gateway::{ArrayGateway, SimulatedArray};
use csi_driver::config::{DEFAULT_CLUSTER_PREFIX, parse_list};
use csi_driver::csi::controller_server::ControllerServer;
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::identity::DRIVER_NAME;
use csi_driver::{
    ArrayContext, ControllerService, DeletionConfig, DeletionWorker, DriverConfig,
    EmptyGroupPolicy, IdentityService, metrics,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "Block array CSI controller for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:// socket path or TCP address)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    csi_endpoint: String,

    /// Driver name
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DRIVER_NAME)]
    driver_name: String,

    /// Array management API address
    #[arg(long, env = "ARRAY_ENDPOINT", default_value = "")]
    endpoint: String,

    /// Array management API user
    #[arg(long, env = "ARRAY_USER", default_value = "")]
    user: String,

    /// Array management API password
    #[arg(long, env = "ARRAY_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Controller instance name reported in plugin info (defaults to hostname)
    #[arg(long, env = "CSI_NODE_NAME")]
    node_name: Option<String>,

    /// Port groups for new masking views (comma separated)
    #[arg(long, env = "ARRAY_PORT_GROUPS", default_value = "")]
    port_groups: String,

    /// Permitted array IDs (comma separated, empty permits all)
    #[arg(long, env = "ARRAY_WHITELIST", default_value = "")]
    array_whitelist: String,

    /// Cluster prefix embedded in every identifier (1 to 3 alphanumerics)
    #[arg(long, env = "CLUSTER_PREFIX", default_value = DEFAULT_CLUSTER_PREFIX)]
    cluster_prefix: String,

    /// Maximum concurrent CSI operations (rate limiting)
    #[arg(long, env = "MAX_CONCURRENT_OPS", default_value = "10")]
    max_concurrent_ops: usize,

    /// Timeout in seconds for synchronous array calls
    #[arg(long, env = "ARRAY_TIMEOUT_SECS", default_value = "30")]
    array_timeout_secs: u64,

    /// What unpublish does with an emptied node storage group (retain, delete)
    #[arg(long, env = "EMPTY_GROUP_POLICY", default_value = "retain")]
    empty_group_policy: EmptyGroupPolicy,

    /// Attempts before a volume deletion is given up
    #[arg(long, env = "DELETION_MAX_ATTEMPTS", default_value = "5")]
    deletion_max_attempts: u32,

    /// Seconds before a failed volume deletion is retried
    #[arg(long, env = "DELETION_RETRY_BACKOFF_SECS", default_value = "5")]
    deletion_retry_backoff_secs: u64,

    /// Milliseconds between deletion job polls
    #[arg(long, env = "DELETION_JOB_POLL_INTERVAL_MS", default_value = "1000")]
    deletion_job_poll_interval_ms: u64,

    /// Job polls per deletion attempt
    #[arg(long, env = "DELETION_JOB_POLL_ATTEMPTS", default_value = "10")]
    deletion_job_poll_attempts: u32,

    /// Finished deletions kept for inspection
    #[arg(long, env = "DELETION_HISTORY_CAPACITY", default_value = "100")]
    deletion_history_capacity: usize,

    /// JSON inventory for the simulated array (a built-in sample is used if unset)
    #[arg(long, env = "SIMULATOR_INVENTORY")]
    simulator_inventory: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn into_config(self) -> Result<DriverConfig, Box<dyn std::error::Error>> {
        let node_name = match self.node_name {
            Some(name) => name,
            None => hostname::get()?.to_string_lossy().to_string(),
        };
        Ok(DriverConfig {
            driver_name: self.driver_name,
            csi_endpoint: self.csi_endpoint,
            endpoint: self.endpoint,
            user: self.user,
            password: self.password,
            node_name,
            port_groups: parse_list(&self.port_groups),
            array_whitelist: parse_list(&self.array_whitelist),
            cluster_prefix: self.cluster_prefix,
            max_concurrent_ops: self.max_concurrent_ops,
            array_timeout: Duration::from_secs(self.array_timeout_secs),
            metrics_addr: self.metrics_addr,
            empty_group_policy: self.empty_group_policy,
            deletion: DeletionConfig {
                max_attempts: self.deletion_max_attempts,
                retry_backoff: Duration::from_secs(self.deletion_retry_backoff_secs),
                job_poll_interval: Duration::from_millis(self.deletion_job_poll_interval_ms),
                job_poll_attempts: self.deletion_job_poll_attempts,
                history_capacity: self.deletion_history_capacity,
            },
            simulator_inventory: self.simulator_inventory,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config()?;
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(addr) = config.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!(
        driver_name = %config.driver_name,
        csi_endpoint = %config.csi_endpoint,
        node_name = %config.node_name,
        cluster_prefix = %config.cluster_prefix,
        "Starting block array CSI driver"
    );
    info!(config = %config.to_json(), "Effective configuration");

    if !config.endpoint.is_empty() {
        warn!(
            endpoint = %config.endpoint,
            "No management API client is built in; serving the simulated array"
        );
    }
    let simulator = match &config.simulator_inventory {
        Some(path) => {
            info!(path = %path.display(), "Loading simulated array inventory");
            SimulatedArray::from_json_file(path)?
        }
        None => SimulatedArray::sample(),
    };
    let gateway: Arc<dyn ArrayGateway> = Arc::new(simulator);

    let arrays = Arc::new(ArrayContext::new(gateway.clone(), config.array_timeout));
    arrays.init(&config.array_whitelist).await;
    let logged_in = match arrays.ensure_logged_into_every_array().await {
        Ok(arrays) => arrays,
        Err(e) => {
            error!(error = %e, "Failed to log into every array - starting in degraded mode");
            arrays.logged_in_arrays().await
        }
    };
    info!(arrays = ?logged_in, "Array sessions established");

    let deletion = Arc::new(DeletionWorker::new(
        gateway,
        &config.cluster_prefix,
        config.deletion.clone(),
    ));
    deletion.start();
    match deletion.recover_marked_volumes(&logged_in).await {
        Ok(count) => {
            if count > 0 {
                info!("Re-queued {} volume(s) marked for deletion", count);
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to recover volumes marked for deletion");
        }
    }

    let identity = IdentityService::new(&config.driver_name, &config.node_name, arrays.clone());
    let controller = ControllerService::new(&config, arrays, deletion.clone());

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(ControllerServer::new(controller));

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    if let Some(path) = config.csi_endpoint.strip_prefix("unix://") {
        // Remove a socket left over from a previous run
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("gRPC server listening on unix://{}", path);
        router
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::UnixListenerStream::new(listener),
                shutdown,
            )
            .await?;
    } else {
        let addr: SocketAddr = config
            .csi_endpoint
            .strip_prefix("tcp://")
            .unwrap_or(&config.csi_endpoint)
            .parse()?;
        info!("gRPC server listening on {}", addr);
        router.serve_with_shutdown(addr, shutdown).await?;
    }

    deletion.stop().await;
    info!("csi-driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    async fn recv(sig: &mut Option<signal::unix::Signal>) {
        match sig {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    tokio::select! {
        _ = recv(&mut sigterm) => {
            info!("Received SIGTERM");
        }
        _ = recv(&mut sigint) => {
            info!("Received SIGINT");
        }
        _ = recv(&mut sighup) => {
            info!("Received SIGHUP, shutting down");
        }
    }
}
