//! Standalone config server for manual and integration testing.
//!
//! Serves an in-memory config for every key from the default application,
//! files from a directory, and optionally activates a new generation on a
//! fixed interval so long-polling clients see changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cfgsync_core::hash::content_hash;
use cfgsync_core::{ApplicationId, FileReference, GetConfigRequest, GetConfigResponse, Trace};
use cfgsync_server::filedistribution::DirectoryFileSource;
use cfgsync_server::network::NetworkConfig;
use cfgsync_server::{
    Collaborators, ConfigResolver, FileDownloader, HostRegistry, ReloadListener, ResolveError,
    RpcServer, ServerConfig,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "test-server", version, about = "cfgsync config RPC server")]
struct CliArgs {
    /// Address to bind the RPC listener to.
    #[arg(long, env = "CFGSYNC_HOST", default_value = "0.0.0.0")]
    host: String,

    /// RPC port. 0 picks a free port.
    #[arg(long, env = "CFGSYNC_PORT", default_value_t = 19070)]
    port: u16,

    /// Request workers. 0 means max(8, available cores).
    #[arg(long, env = "CFGSYNC_NUM_WORKERS", default_value_t = 0)]
    num_workers: usize,

    /// Queued requests beyond this are rejected.
    #[arg(long, env = "CFGSYNC_MAX_GET_CONFIG_CLIENTS", default_value_t = 1_000_000)]
    max_get_config_clients: usize,

    /// Grace period for in-flight requests at shutdown, in seconds.
    #[arg(long, env = "CFGSYNC_SHUTDOWN_TIMEOUT_SECS", default_value_t = 60)]
    shutdown_timeout_secs: u64,

    /// Directory of distributable files, laid out as `<reference>/<file>`.
    #[arg(long, env = "CFGSYNC_FILE_DIR", default_value = "files")]
    file_dir: PathBuf,

    /// Part size of file transfers, in bytes.
    #[arg(long, env = "CFGSYNC_FILE_CHUNK_SIZE", default_value_t = 0x10_0000)]
    file_chunk_size: usize,

    /// Activate a new config generation this often, in seconds. 0 disables.
    #[arg(long, env = "CFGSYNC_RELOAD_INTERVAL_SECS", default_value_t = 0)]
    reload_interval_secs: u64,

    /// Expose Prometheus metrics on this port.
    #[arg(long, env = "CFGSYNC_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log as JSON lines.
    #[arg(long, env = "CFGSYNC_LOG_JSON")]
    log_json: bool,
}

impl CliArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            network: NetworkConfig {
                host: self.host.clone(),
                port: self.port,
                ..NetworkConfig::default()
            },
            num_workers: self.num_workers,
            max_get_config_clients: self.max_get_config_clients,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            file_chunk_size: self.file_chunk_size,
            ..ServerConfig::default()
        }
    }
}

/// Every key resolves to a payload derived from its name and the current
/// generation.
#[derive(Debug)]
struct GeneratedConfigs {
    generation: AtomicI64,
}

#[async_trait]
impl ConfigResolver for GeneratedConfigs {
    async fn resolve(
        &self,
        _application: &ApplicationId,
        request: &GetConfigRequest,
    ) -> Result<GetConfigResponse, ResolveError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let payload = format!(
            "{}.{} generation {generation}",
            request.key.namespace, request.key.name
        )
        .into_bytes();
        Ok(GetConfigResponse {
            key: request.key.clone(),
            generation,
            payload_fingerprint: format!("{:016x}", content_hash(&payload)),
            payload,
            internal_redeploy: false,
            trace: Trace::default(),
        })
    }
}

/// This server has no other source to download from.
#[derive(Debug)]
struct NoUpstream;

#[async_trait]
impl FileDownloader for NoUpstream {
    async fn download_if_needed(&self, reference: FileReference) -> anyhow::Result<()> {
        warn!(reference = %reference, "No upstream file source configured");
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Metrics exported on {addr}");
    }

    let configs = Arc::new(GeneratedConfigs {
        generation: AtomicI64::new(1),
    });
    let collaborators = Collaborators {
        resolver: Arc::clone(&configs) as Arc<dyn ConfigResolver>,
        router: Arc::new(HostRegistry::new()),
        files: Arc::new(DirectoryFileSource::new(args.file_dir.clone())),
        downloader: Arc::new(NoUpstream),
    };

    let mut server = RpcServer::new(args.server_config(), collaborators);
    let port = server.start().await?;
    info!(port, files = %args.file_dir.display(), "cfgsync test server started");

    if args.reload_interval_secs > 0 {
        let dispatcher = server.dispatcher().clone();
        let interval = Duration::from_secs(args.reload_interval_secs);
        tokio::spawn(async move {
            let application = ApplicationId::default_application();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let generation = configs.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(generation, "Activating new config generation");
                dispatcher.config_activated(&application, generation).await;
            }
        });
    }

    server
        .serve(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
        })
        .await
}
