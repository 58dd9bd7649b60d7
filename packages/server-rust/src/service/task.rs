//! Resolution of one `getConfig` request on a worker.

use cfgsync_core::config::error_code;
use cfgsync_core::ApplicationId;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use super::delayed::DelayedConfigResponse;
use super::dispatcher::Dispatcher;
use super::pool::{Rejection, Task};
use super::request::{ConfigRequest, TRACE_LEVEL, TRACE_LEVEL_DETAILED};

/// Resolves a request and either answers it or parks it until its config
/// changes. Every run resolves from scratch.
pub struct GetConfigTask {
    dispatcher: Dispatcher,
    request: ConfigRequest,
    /// Answer even if nothing changed. Set for requests re-run after a reload.
    force_response: bool,
}

impl GetConfigTask {
    pub fn new(dispatcher: Dispatcher, request: ConfigRequest, force_response: bool) -> Self {
        Self {
            dispatcher,
            request,
            force_response,
        }
    }

    async fn process(self) {
        let Self {
            dispatcher,
            mut request,
            force_response,
        } = self;

        if !request.is_connection_valid() {
            debug!(host = request.hostname(), "Client disconnected before processing");
            request.abandon();
            return;
        }
        let description = request.body.short_description();
        request.trace(TRACE_LEVEL_DETAILED, format!("Processing {description}"));

        let application = match dispatcher.resolve_application(&request.body) {
            Ok(application) => application,
            Err(e) => {
                debug!("Rejecting {description}: {e}");
                request.respond_error(error_code::APPLICATION_NOT_LOADED, e.to_string());
                return;
            }
        };

        let activations = dispatcher.generations().activation_count();
        let response = match dispatcher
            .collaborators()
            .resolver
            .resolve(&application, &request.body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("{}failed resolving {description}: {e}", application.log_prefix());
                request.respond_error(e.error_code(), e.to_string());
                return;
            }
        };

        if force_response || !request.body.wants_long_poll() || response.is_change_for(&request.body) {
            request.trace(
                TRACE_LEVEL,
                format!("Returning config generation {}", response.generation),
            );
            trace!(
                "{}responding to {description} with generation {} after {:?}",
                application.log_prefix(),
                response.generation,
                request.elapsed()
            );
            request.respond(response);
            return;
        }

        park(&dispatcher, request, application, response, activations);
    }
}

/// Parks an unchanged request. If a newer generation was activated before
/// the request became visible to reload drains, it is claimed back and run
/// again at once. Wildcard requests see every application's activations, so
/// for them any activation since `activations` counts.
fn park(
    dispatcher: &Dispatcher,
    mut request: ConfigRequest,
    application: ApplicationId,
    unchanged: cfgsync_core::GetConfigResponse,
    activations: u64,
) {
    let generation = unchanged.generation;
    let timeout = request.timeout();
    request.trace(
        TRACE_LEVEL_DETAILED,
        format!("Config unchanged, delaying response for up to {timeout:?}"),
    );
    let entry = dispatcher.delayed().delay(
        DelayedConfigResponse {
            request,
            application: application.clone(),
            unchanged,
        },
        timeout,
    );

    let generations = dispatcher.generations();
    let superseded = if application.is_global() {
        generations.activated_since(activations)
    } else {
        generations.has_newer_generation(&application, generation)
    };
    if superseded {
        if let Some(parked) = dispatcher.delayed().reclaim(&entry) {
            debug!(
                "{}generation {generation} superseded while parking, resolving again",
                application.log_prefix()
            );
            dispatcher.submit_config_request(parked.request, true);
        }
    }
}

impl Task for GetConfigTask {
    fn name(&self) -> &'static str {
        "getConfig"
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(self.process())
    }

    fn reject(self: Box<Self>, reason: Rejection) {
        let message = match reason {
            Rejection::QueueFull => {
                "getConfig request queue size is larger than configured max limit"
            }
            Rejection::ShuttingDown => "server is shutting down",
        };
        self.request
            .respond_error(error_code::INTERNAL_ERROR, message);
    }
}
