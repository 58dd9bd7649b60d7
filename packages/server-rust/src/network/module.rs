//! Network module with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener, `serve()`
//! accepts connections until shutdown, and `release()` closes every
//! connection and drops the listener once the rest of the server has
//! wound down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::ConnectionRegistry;
use super::methods::MethodTable;
use super::shutdown::ShutdownController;
use super::transport::spawn_connection;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    methods: Arc<MethodTable>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, methods: Arc<MethodTable>) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            methods,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!("RPC listener bound to {}:{}", self.config.host, port);
        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until `shutdown` resolves or the shutdown
    /// controller is triggered. The listener stays bound until
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns an error if called before `start()`.
    pub async fn serve(&self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        let Some(listener) = self.listener.as_ref() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let mut signal = self.shutdown.shutdown_receiver();
        tokio::pin!(shutdown);
        self.shutdown.set_ready();

        while !self.shutdown.is_shutting_down() {
            tokio::select! {
                () = &mut shutdown => break,
                _ = signal.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %addr, "Failed to set TCP_NODELAY: {e}");
                        }
                        spawn_connection(
                            stream,
                            addr.to_string(),
                            &self.registry,
                            &self.config.connection,
                            Arc::clone(&self.methods),
                            Some(self.shutdown.connection_guard()),
                        );
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        self.shutdown.trigger_shutdown();
        info!("Stopped accepting connections");
        Ok(())
    }

    /// Closes every connection, waits for their tasks to finish and drops
    /// the listener.
    pub async fn release(&mut self) {
        self.shutdown.trigger_shutdown();
        let handles = self.registry.drain_all();
        for handle in &handles {
            handle.close("server shutting down");
        }
        if !self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            warn!(
                open = self.shutdown.open_connections(),
                "Connections still open after drain timeout"
            );
        }
        self.listener = None;
        info!(closed = handles.len(), "Released RPC listener");
    }
}

#[cfg(test)]
mod tests {
    use cfgsync_core::Value;

    use super::*;
    use crate::network::client::RpcClient;
    use crate::network::config::ConnectionConfig;
    use crate::network::methods::{Method, RpcCall};
    use crate::network::shutdown::HealthState;

    fn module() -> NetworkModule {
        let methods = MethodTable::new().with(Method::new("ping", "", "i", |call: RpcCall| {
            call.responder.respond(vec![Value::Int32(0)]);
        }));
        NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..NetworkConfig::default()
            },
            Arc::new(methods),
        )
    }

    #[tokio::test]
    async fn serve_without_start_fails() {
        let module = module();
        assert!(module.serve(std::future::pending()).await.is_err());
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_releases() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert_ne!(port, 0);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let controller = module.shutdown_controller();
        let registry = module.registry();
        let server = tokio::spawn(async move {
            module
                .serve(async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap();
            module.release().await;
            module
        });

        let client = RpcClient::connect(
            &format!("127.0.0.1:{port}"),
            MethodTable::new(),
            &ConnectionConfig::default(),
        )
        .await
        .unwrap();
        let values = client
            .invoke("ping", vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(values, vec![Value::Int32(0)]);
        assert_eq!(registry.count(), 1);

        stop_tx.send(()).unwrap();
        server.await.unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
        assert_eq!(registry.count(), 0);
    }
}
