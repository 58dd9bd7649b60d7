//! Request processing.
//!
//! 1. **Handlers** (`handlers`): the RPC method table
//! 2. **Dispatch** (`dispatcher`): routing to applications, the bounded
//!    worker pool and reload handling
//! 3. **Tasks** (`task`): resolving one `getConfig` request
//! 4. **Long-poll** (`delayed`, `generation`): parked requests and the
//!    generations that release them

pub mod delayed;
pub mod dispatcher;
pub mod generation;
pub mod handlers;
pub mod pool;
pub mod request;
pub mod task;

#[cfg(test)]
pub(crate) mod testkit;

pub use delayed::{DelayedConfigResponse, DelayedEntry, DelayedResponses};
pub use dispatcher::{Collaborators, Dispatcher};
pub use generation::GenerationTracker;
pub use handlers::build_method_table;
pub use pool::{Rejection, Task, WorkerPool};
pub use request::ConfigRequest;
pub use task::GetConfigTask;
