//! Outbound RPC connection, used by peers that fetch configs and receive
//! files from the server.

use std::sync::Arc;
use std::time::Duration;

use cfgsync_core::Value;
use tokio::net::TcpStream;

use super::config::ConnectionConfig;
use super::connection::{ConnectionHandle, ConnectionRegistry};
use super::methods::MethodTable;
use super::transport::spawn_connection;
use crate::error::RpcError;

/// A client connection. The peer may call back into `methods`, which is how
/// file receivers accept chunked transfers.
#[derive(Debug)]
pub struct RpcClient {
    handle: Arc<ConnectionHandle>,
    _registry: Arc<ConnectionRegistry>,
}

impl RpcClient {
    /// Connects to `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established.
    pub async fn connect(
        addr: &str,
        methods: MethodTable,
        config: &ConnectionConfig,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = spawn_connection(
            stream,
            addr.to_string(),
            &registry,
            config,
            Arc::new(methods),
            None,
        );
        Ok(Self {
            handle,
            _registry: registry,
        })
    }

    /// # Errors
    ///
    /// See [`ConnectionHandle::invoke`].
    pub async fn invoke(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, RpcError> {
        self.handle.invoke(method, params, timeout).await
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn close(&self) {
        self.handle.close("closed by client");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}
