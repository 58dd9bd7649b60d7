//! Request dispatch: application routing, the worker pool, the delayed
//! long-poll queue and reload handling.

use std::sync::Arc;

use async_trait::async_trait;
use cfgsync_core::{ApplicationId, GetConfigRequest, TenantName};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::delayed::{DelayedConfigResponse, DelayedResponses};
use super::generation::GenerationTracker;
use super::pool::{Task, WorkerPool};
use super::request::ConfigRequest;
use super::task::GetConfigTask;
use crate::config::ServerConfig;
use crate::error::RoutingError;
use crate::filedistribution::FileServer;
use crate::liveness::HostLivenessTracker;
use crate::traits::{ConfigResolver, FileDownloader, FileSource, ReloadListener, TenantRouter};

/// External components the dispatcher calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ConfigResolver>,
    pub router: Arc<dyn TenantRouter>,
    pub files: Arc<dyn FileSource>,
    pub downloader: Arc<dyn FileDownloader>,
}

/// Shared handle to the request processing machinery. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    collaborators: Collaborators,
    generations: Arc<GenerationTracker>,
    delayed: Arc<DelayedResponses>,
    pool: Arc<WorkerPool>,
    liveness: Arc<HostLivenessTracker>,
    files: Arc<FileServer>,
}

impl Dispatcher {
    /// Starts the worker pool. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let pool = WorkerPool::new(config.worker_count(), config.max_get_config_clients);
        let files = FileServer::new(
            Arc::clone(&collaborators.files),
            Arc::clone(&collaborators.downloader),
            config.file_chunk_size,
            config.file_invoke_timeout,
        );
        Self {
            config: Arc::new(config),
            collaborators,
            generations: Arc::new(GenerationTracker::new()),
            delayed: Arc::new(DelayedResponses::new()),
            pool: Arc::new(pool),
            liveness: Arc::new(HostLivenessTracker::new()),
            files: Arc::new(files),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    #[must_use]
    pub fn generations(&self) -> &GenerationTracker {
        &self.generations
    }

    #[must_use]
    pub fn delayed(&self) -> &Arc<DelayedResponses> {
        &self.delayed
    }

    #[must_use]
    pub fn liveness(&self) -> &HostLivenessTracker {
        &self.liveness
    }

    #[must_use]
    pub fn file_server(&self) -> &FileServer {
        &self.files
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Application a request is served from.
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownHost`] if no tenant claims the client host and
    /// no default application is configured.
    pub fn resolve_application(
        &self,
        request: &GetConfigRequest,
    ) -> Result<ApplicationId, RoutingError> {
        if request.key.is_wildcard() {
            return Ok(ApplicationId::global());
        }
        let hostname = &request.client_hostname;
        if let Some(application) = self.collaborators.router.resolve_application(hostname) {
            return Ok(application);
        }
        metrics::counter!("cfgsync_unknown_host_requests_total").increment(1);
        match &self.config.default_application {
            Some(default) => {
                debug!(host = %hostname, "Unknown host, using {default}");
                Ok(default.clone())
            }
            None => Err(RoutingError::UnknownHost {
                hostname: hostname.clone(),
            }),
        }
    }

    /// Queues `request` for resolution. Returns `false` if the queue was
    /// full, in which case the request has already been answered with an
    /// error.
    pub fn submit_config_request(&self, request: ConfigRequest, force_response: bool) -> bool {
        self.submit(Box::new(GetConfigTask::new(
            self.clone(),
            request,
            force_response,
        )))
    }

    pub fn submit(&self, task: Box<dyn Task>) -> bool {
        self.pool.try_submit(task)
    }

    /// Answers every request parked on `application` (and on the global
    /// application) by resolving it again, and waits until all of them have
    /// been handled.
    pub async fn config_reloaded(&self, application: &ApplicationId) {
        let drained = self.delayed.drain(application);
        info!(
            "{}config reloaded, resolving {} delayed requests again",
            application.log_prefix(),
            drained.len()
        );
        self.resubmit(drained).await;
    }

    async fn resubmit(&self, drained: Vec<DelayedConfigResponse>) {
        let pending: Vec<_> = drained
            .into_iter()
            .filter_map(|parked| {
                self.pool.submit_tracked(Box::new(GetConfigTask::new(
                    self.clone(),
                    parked.request,
                    true,
                )))
            })
            .collect();
        join_all(pending).await;
    }

    #[must_use]
    pub fn statistics(&self) -> String {
        format!("Delayed responses queue size: {}", self.delayed.size())
    }

    /// Stops processing. Queued and running tasks get the configured grace
    /// period; parked requests are dropped without an answer.
    pub async fn stop(&self) {
        if !self.pool.shutdown(self.config.shutdown_timeout).await {
            warn!("Request workers did not finish within the shutdown grace period");
        }
        self.delayed.stop();
    }
}

#[async_trait]
impl ReloadListener for Dispatcher {
    async fn config_activated(&self, application: &ApplicationId, generation: i64) {
        let active = self.generations.set_active_generation(application, generation);
        if active != generation {
            return;
        }
        self.config_reloaded(application).await;
    }

    async fn application_removed(&self, application: &ApplicationId) {
        info!("{}application removed", application.log_prefix());
        self.config_reloaded(application).await;
    }

    async fn tenant_removed(&self, tenant: &TenantName) {
        self.collaborators.router.remove_tenant(tenant);
        let drained = self.delayed.drain_tenant(tenant);
        info!(
            tenant = %tenant,
            "Tenant removed, resolving {} delayed requests again",
            drained.len()
        );
        self.resubmit(drained).await;
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("delayed", &self.delayed.size())
            .finish_non_exhaustive()
    }
}
