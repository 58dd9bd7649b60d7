//! A received `getConfig` call, detached from its connection.

use std::time::{Duration, Instant};

use cfgsync_core::config::error_code;
use cfgsync_core::{GetConfigRequest, GetConfigResponse, Value};
use tracing::warn;

use crate::network::Responder;

/// Level at which request handling steps are recorded in the client trace.
pub const TRACE_LEVEL: i32 = 6;
/// Level for the more verbose steps.
pub const TRACE_LEVEL_DETAILED: i32 = 9;

/// A config request together with the right to answer it.
#[derive(Debug)]
pub struct ConfigRequest {
    pub body: GetConfigRequest,
    responder: Responder,
    received_at: Instant,
}

impl ConfigRequest {
    pub fn new(body: GetConfigRequest, responder: Responder) -> Self {
        Self {
            body,
            responder,
            received_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.responder.request_id()
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.body.client_hostname
    }

    /// How long the request may be held waiting for a change.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.body.timeout_ms).unwrap_or(0))
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Whether the client is still connected.
    #[must_use]
    pub fn is_connection_valid(&self) -> bool {
        self.responder.connection().is_valid()
    }

    pub fn trace(&mut self, level: i32, message: impl Into<String>) {
        self.body.trace.trace(level, message);
    }

    /// Answers with `response`, carrying the request's trace along.
    pub fn respond(self, mut response: GetConfigResponse) {
        let Self {
            body, responder, ..
        } = self;
        let mut trace = body.trace;
        trace.entries.append(&mut response.trace.entries);
        response.trace = trace;
        match response.encode() {
            Ok(bytes) => responder.respond(vec![Value::Data(bytes)]),
            Err(e) => {
                warn!("Failed to encode config response for {}: {e}", body.key.name);
                responder.fail(error_code::INTERNAL_ERROR, e.to_string());
            }
        }
    }

    pub fn respond_error(self, code: u32, message: impl Into<String>) {
        self.responder.fail(code, message);
    }

    /// Drops the request without answering.
    pub fn abandon(self) {
        self.responder.abandon();
    }
}
