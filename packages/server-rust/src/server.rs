//! The assembled RPC server.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;
use crate::network::{HealthState, NetworkModule, ShutdownController};
use crate::service::{build_method_table, Collaborators, Dispatcher};

/// Listener, dispatcher and their shutdown ordering.
///
/// ```text
/// new() -> start() -> serve(shutdown)
///                        accept until shutdown
///                        stop workers (grace period)
///                        drop parked long-polls
///                        close connections, release listener
/// ```
pub struct RpcServer {
    dispatcher: Dispatcher,
    network: NetworkModule,
}

impl RpcServer {
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let network_config = config.network.clone();
        let dispatcher = Dispatcher::new(config, collaborators);
        let methods = Arc::new(build_method_table(&dispatcher));
        Self {
            network: NetworkModule::new(network_config, methods),
            dispatcher,
        }
    }

    /// Handle for reload events and statistics; stays usable after the
    /// server is consumed by [`serve`](Self::serve).
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.network.shutdown_controller()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.network.shutdown_controller().health_state()
    }

    /// Binds the listener and returns the bound port.
    ///
    /// # Errors
    ///
    /// Fails if the configured address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        self.network.start().await
    }

    /// Serves until `shutdown` resolves, then shuts everything down in order.
    ///
    /// # Errors
    ///
    /// Fails if called before [`start`](Self::start).
    pub async fn serve(mut self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        self.network.serve(shutdown).await?;
        info!("Shutting down: {}", self.dispatcher.statistics());
        self.dispatcher.stop().await;
        self.network.release().await;
        info!("Server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("dispatcher", &self.dispatcher)
            .field("health", &self.health_state())
            .finish_non_exhaustive()
    }
}
