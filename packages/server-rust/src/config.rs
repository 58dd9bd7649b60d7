use std::time::Duration;

use cfgsync_core::ApplicationId;

use crate::network::NetworkConfig;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    /// Request workers. 0 means `max(8, available cores)`.
    pub num_workers: usize,
    /// Bound of the request queue; submissions beyond it are rejected.
    pub max_get_config_clients: usize,
    /// Grace period for queued and running requests at shutdown.
    pub shutdown_timeout: Duration,
    /// Application serving hosts no tenant claims. `None` rejects them.
    pub default_application: Option<ApplicationId>,
    /// Part size for chunked file transfers.
    pub file_chunk_size: usize,
    /// Timeout of each call made on a file receiver.
    pub file_invoke_timeout: Duration,
}

impl ServerConfig {
    /// Effective number of request workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        cores.max(8)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            num_workers: 0,
            max_get_config_clients: 1_000_000,
            shutdown_timeout: Duration::from_secs(60),
            default_application: Some(ApplicationId::default_application()),
            file_chunk_size: 0x10_0000,
            file_invoke_timeout: Duration::from_secs(600),
        }
    }
}
