//! RPC transport: framing, connections, method dispatch and the listener.

pub mod client;
pub mod config;
pub mod connection;
pub mod methods;
pub mod module;
pub mod shutdown;
pub mod transport;

pub use client::RpcClient;
pub use config::*;
pub use connection::*;
pub use methods::{Method, MethodHandler, MethodTable, RpcCall};
pub use module::NetworkModule;
pub use shutdown::*;
