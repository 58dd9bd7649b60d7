//! Network configuration types for the RPC listener and its connections.

use std::time::Duration;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
    /// How long to wait for connections to close during shutdown.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 19070,
            connection: ConnectionConfig::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-connection configuration controlling backpressure and framing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait for room in a full outbound channel.
    pub send_timeout: Duration,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_frame_length: 16 * 1024 * 1024, // 16 MiB
        }
    }
}
