//! `cfgsync` server: long-poll config RPC with bounded dispatch and chunked
//! file distribution.

pub mod config;
pub mod error;
pub mod filedistribution;
pub mod liveness;
pub mod network;
pub mod routing;
pub mod server;
pub mod service;
pub mod traits;

pub use config::ServerConfig;
pub use error::{RoutingError, RpcError};
pub use routing::HostRegistry;
pub use server::RpcServer;
pub use service::{Collaborators, Dispatcher};
pub use traits::{
    ConfigResolver, FileDownloader, FileSource, ReloadListener, ResolveError, TenantRouter,
};
